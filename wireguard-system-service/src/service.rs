/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Ties the data directory, the protocol core (`wireguard-proto::Device`),
 * the control socket (`uapi_socket`), and the packet-processing engine
 * (`wireguard_rt::Engine`) into one running daemon. Grounded on
 * `zerotier-system-service/src/service.rs`'s `Service::new` shape (load or
 * generate the identity, construct the core object, start background
 * tasks) and `main.rs`'s `service::Service::new(handle, base_path, ...)`
 * call site.
 *
 * A real platform `Tun` (opening `/dev/net/tun`, attaching addresses and
 * routes) is kernel integration, which spec.md §1 explicitly places outside
 * this core's scope alongside the tunnel device itself. Until a caller
 * supplies one, this service runs against `wireguard_rt::testutil::LoopbackTun`
 * so every other subsystem -- identity, control socket, handshake, routing,
 * pipelines -- is exercised exactly as it would be in production; swapping
 * in a real `Tun` implementation at a deployment site is a drop-in
 * replacement of the `tun` argument to [`Service::start`].
 */

use std::path::PathBuf;
use std::sync::Arc;

use wireguard_proto::Device;
use wireguard_rt::testutil::LoopbackTun;
use wireguard_rt::{Engine, EngineConfig, TokioUdp};

use crate::datadir::DataDir;
use crate::uapi_socket;

pub struct Service {
    pub device: Arc<Device>,
    pub engine: Engine,
    pub metrics: Arc<wireguard_rt::Metrics>,
    uapi_task: tokio::task::JoinHandle<()>,
}

impl Service {
    /// Load (or generate, on first run) the identity in `base_path`, bring
    /// up the control socket and the engine, and return the running
    /// service. `tun` defaults to an in-process loopback device; pass a
    /// real platform `Tun` implementation to exchange packets with the
    /// host network stack.
    pub async fn start(base_path: PathBuf, interface: &str, listen_port: u16) -> std::io::Result<Self> {
        let data_dir = DataDir::open(base_path).await?;
        let keypair = data_dir.load_or_generate_identity().await?;
        let device = Arc::new(Device::new(keypair));
        device.set_state(wireguard_proto::DeviceState::Up);
        *device.listen_port.write() = listen_port;

        let tun = Arc::new(LoopbackTun::new(1420));
        let udp = Arc::new(TokioUdp::new(16));
        let engine = Engine::start(
            device.clone(),
            tun,
            udp,
            EngineConfig { listen_port, ..Default::default() },
        )
        .await?;

        let socket_path = uapi_socket::default_socket_path(&data_dir.base_path, interface);
        let uapi_task = uapi_socket::serve(socket_path, device.clone())?;
        let metrics = engine.metrics.clone();

        tracing::info!(public_key = %hex::encode(device.public_key()), %listen_port, "service started");
        Ok(Self { device, engine, metrics, uapi_task })
    }

    pub fn shutdown(&self) {
        self.device.set_state(wireguard_proto::DeviceState::Closed);
        self.engine.shutdown();
        self.uapi_task.abort();
    }

    /// Render `Device::debug_snapshot()` plus the engine's metrics as
    /// pretty-printed JSON, for the `--dump-json` CLI flag (SPEC_FULL.md
    /// §4.9) and for integration tests that want to assert on internal
    /// state without reaching into private fields.
    pub fn dump_json(&self) -> String {
        let body = serde_json::json!({
            "device": self.device.debug_snapshot(),
            "metrics": self.metrics.snapshot(),
        });
        serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string())
    }

    /// Print [`Service::dump_json`] to stdout on `interval` until the
    /// returned task is aborted.
    pub fn spawn_periodic_dump(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let device = self.device.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let body = serde_json::json!({
                    "device": device.debug_snapshot(),
                    "metrics": metrics.snapshot(),
                });
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string()));
            }
        })
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}
