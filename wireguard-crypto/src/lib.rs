/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Curve25519 DH, ChaCha20-Poly1305 AEAD, BLAKE2s hash/KDF, and TAI64N
 * timestamp primitives used by the Noise_IKpsk2 handshake and transport.
 */

pub mod aead;
pub mod dh;
pub mod hash;
pub mod secret;
pub mod tai64n;

pub use secret::Secret;
