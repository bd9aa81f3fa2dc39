/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Everything `wireguard-proto` deliberately stays ignorant of: the
 * `Tun`/`Udp` capability boundary, a tokio-driven engine that schedules the
 * reader/writer/handshake/timer tasks around it, a pooled buffer allocator,
 * and process-wide metrics. See `Engine` for the entry point.
 */

pub mod buffer;
pub mod engine;
pub mod metrics;
pub mod pool;
pub mod tun;
pub mod udp;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use buffer::PacketBuffer;
pub use engine::{Engine, EngineConfig};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{Pool, PoolFactory, Pooled};
pub use tun::{Tun, TunEvent};
pub use udp::{Endpoint, RecvBatch, TokioUdp, Udp};
