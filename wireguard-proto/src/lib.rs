/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Noise_IKpsk2 handshake state machine, Cryptokey Routing trie, and the
 * peer/device runtime that ties them together with the parallel
 * encrypt/decrypt pipelines.
 */

pub mod constants;
pub mod cookie;
pub mod device;
pub mod error;
pub mod index_table;
pub mod keypair;
pub mod noise;
pub mod peer;
pub mod pipeline;
pub mod trie;
pub mod util;
pub mod wire;

pub use device::{Device, DeviceSnapshot, DeviceState, PeerHandle, PeerSnapshot};
pub use error::{ProtocolError, Result};
pub use peer::Peer;
