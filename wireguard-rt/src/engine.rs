/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * The runtime glue: reads the TUN device and the UDP socket concurrently,
 * drives the handshake state machine and the parallel encrypt/decrypt
 * pipelines, and runs the peer timer sweep (spec.md §4.7/§5). Grounded on
 * `vl1-service/src/vl1service.rs`'s `udp_bind_daemon` (one task per
 * listener, `node().do_background_tasks()` interval loop) and its `Drop`
 * impl that aborts every spawned daemon task.
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wireguard_proto::constants::{
    DEFAULT_HANDSHAKE_QUEUE_CAPACITY, KEEPALIVE_TIMEOUT_MS, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME_MS,
    REKEY_ATTEMPT_TIME_MS, REKEY_TIMEOUT_MS,
};
use wireguard_proto::pipeline::{inbound::InboundPipeline, outbound::OutboundPipeline, PacketSink};
use wireguard_proto::wire::{self, CookieReply, Initiation, Response, MESSAGE_TYPE_COOKIE_REPLY, MESSAGE_TYPE_INITIATION, MESSAGE_TYPE_RESPONSE, MESSAGE_TYPE_TRANSPORT};
use wireguard_proto::{Device, Peer, ProtocolError};

use crate::metrics::Metrics;
use crate::tun::Tun;
use crate::udp::{Endpoint, Udp};

/// Tunables that are not part of the wire protocol itself, just how this
/// runtime schedules its own work (spec.md §9 design notes: handshake
/// queue depth is explicitly a runtime tunable, not a protocol constant).
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub listen_port: u16,
    pub handshake_queue_capacity: usize,
    pub handshake_workers: usize,
    pub timer_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            handshake_queue_capacity: DEFAULT_HANDSHAKE_QUEUE_CAPACITY,
            handshake_workers: 2,
            timer_interval_ms: 250,
        }
    }
}

/// Adapts the async [`Udp::send`] collaborator to the synchronous
/// [`PacketSink`] the transport pipelines expect: `send_to` only enqueues,
/// a dedicated task drains the queue and performs the actual send.
struct UdpSink {
    queue: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl PacketSink for UdpSink {
    fn send_to(&self, dest: SocketAddr, data: &[u8]) -> std::io::Result<()> {
        self.queue
            .send((dest, data.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "udp send queue closed"))
    }
}

/// Ties a [`Device`] to a concrete [`Tun`]/[`Udp`] pair and runs the tasks
/// that keep the tunnel alive. Dropping the engine aborts every task it
/// spawned, matching `vl1-service`'s daemon-task cleanup.
pub struct Engine {
    pub device: Arc<Device>,
    pub metrics: Arc<Metrics>,
    outbound: Arc<OutboundPipeline<UdpSink>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Bind the UDP socket, spawn the reader/writer/timer tasks, and start
    /// serving `device` over `tun`/`udp`. The returned `Engine` owns those
    /// tasks for as long as it lives.
    pub async fn start<T, U>(device: Arc<Device>, tun: Arc<T>, udp: Arc<U>, config: EngineConfig) -> std::io::Result<Self>
    where
        T: Tun,
        U: Udp,
    {
        udp.open(config.listen_port).await?;
        let metrics = Arc::new(Metrics::new());

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();
        let outbound = Arc::new(OutboundPipeline::new(Arc::new(UdpSink { queue: raw_tx.clone() })));
        let inbound = Arc::new(InboundPipeline::new());
        // MAC1 of the last handshake message we sent under each local index,
        // kept only long enough to serve as AAD if a `CookieReply` answers
        // it (spec.md §4.3).
        let sent_mac1: Arc<DashMap<u32, [u8; 16]>> = Arc::new(DashMap::new());

        let mut tasks = Vec::new();

        // Writer: the only task that ever calls `udp.send`, so pipeline
        // sends and raw handshake/cookie-reply sends interleave in the
        // order they were enqueued without needing their own lock.
        {
            let udp = udp.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((dest, data)) = raw_rx.recv().await {
                    if let Err(err) = udp.send(&Endpoint::new(dest), &data).await {
                        tracing::debug!(?err, ?dest, "udp send failed");
                    }
                }
            }));
        }

        let (handshake_tx, handshake_rx) = mpsc::channel(config.handshake_queue_capacity);
        let handshake_rx = Arc::new(tokio::sync::Mutex::new(handshake_rx));
        for _ in 0..config.handshake_workers.max(1) {
            let device = device.clone();
            let metrics = metrics.clone();
            let raw_tx = raw_tx.clone();
            let handshake_rx = handshake_rx.clone();
            let sent_mac1 = sent_mac1.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let item = handshake_rx.lock().await.recv().await;
                    let Some((from, data)) = item else { break };
                    handle_handshake_message(&device, &metrics, &raw_tx, &sent_mac1, from, &data);
                }
            }));
        }

        {
            let device = device.clone();
            let udp = udp.clone();
            let tun = tun.clone();
            let inbound = inbound.clone();
            let metrics = metrics.clone();
            let handshake_tx = handshake_tx.clone();
            let sent_mac1 = sent_mac1.clone();
            tasks.push(tokio::spawn(async move {
                udp_reader_loop(device, udp, tun, inbound, metrics, handshake_tx, sent_mac1).await;
            }));
        }

        {
            let device = device.clone();
            let tun = tun.clone();
            let outbound = outbound.clone();
            let metrics = metrics.clone();
            let raw_tx = raw_tx.clone();
            let sent_mac1 = sent_mac1.clone();
            tasks.push(tokio::spawn(async move {
                tun_reader_loop(device, tun, outbound, metrics, raw_tx, sent_mac1).await;
            }));
        }

        {
            let device = device.clone();
            let raw_tx = raw_tx.clone();
            let outbound = outbound.clone();
            let metrics = metrics.clone();
            let interval = Duration::from_millis(config.timer_interval_ms);
            tasks.push(tokio::spawn(async move {
                timer_loop(device, outbound, metrics, raw_tx, sent_mac1, interval).await;
            }));
        }

        Ok(Self { device, metrics, outbound, tasks: SyncMutex::new(tasks) })
    }

    /// Encrypt and send one plaintext IP packet to `peer` through the
    /// outbound pipeline, bypassing the TUN device. Exposed for tests and
    /// for callers (e.g. a UAPI `set` handler) that construct packets
    /// programmatically.
    pub async fn send_to_peer(&self, peer: &Arc<Peer>, plaintext: &[u8]) -> wireguard_proto::Result<()> {
        self.outbound.send(&self.device, peer, plaintext).await
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn udp_reader_loop<T: Tun, U: Udp>(
    device: Arc<Device>,
    udp: Arc<U>,
    tun: Arc<T>,
    inbound: Arc<InboundPipeline>,
    metrics: Arc<Metrics>,
    handshake_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    sent_mac1: Arc<DashMap<u32, [u8; 16]>>,
) {
    let batch_size = udp.batch_size().max(1);
    loop {
        let batch = match udp.recv(batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::debug!(?err, "udp recv failed");
                continue;
            }
        };

        let mut transport_handles = Vec::with_capacity(batch.buffers.len());
        for (i, data) in batch.buffers.iter().enumerate() {
            let data = &data[..batch.sizes[i]];
            let from = batch.endpoints[i].addr();
            match wire::peek_message_type(data) {
                Some(MESSAGE_TYPE_TRANSPORT) => {
                    let device = device.clone();
                    let inbound = inbound.clone();
                    let metrics = metrics.clone();
                    let data = data.to_vec();
                    transport_handles.push(Some(tokio::spawn(async move {
                        let result = inbound.receive(&device, from, &data).await;
                        (result, metrics)
                    })));
                }
                Some(MESSAGE_TYPE_INITIATION) | Some(MESSAGE_TYPE_RESPONSE) => {
                    transport_handles.push(None);
                    // spec.md §4.3: the device is "under load" once the
                    // handshake queue's occupancy exceeds 1/8 of its
                    // capacity; this latches the cookie-challenge gate for
                    // UNDER_LOAD_AFTER_TIME regardless of occupancy right
                    // after.
                    let occupancy = handshake_tx.max_capacity() - handshake_tx.capacity();
                    if occupancy * 8 > handshake_tx.max_capacity() {
                        device.cookie_checker.mark_under_load_if_needed(wireguard_proto::util::now_ms());
                    }
                    if handshake_tx.try_send((from, data.to_vec())).is_err() {
                        tracing::debug!(?from, "dropped handshake message, queue full");
                    }
                }
                Some(MESSAGE_TYPE_COOKIE_REPLY) => {
                    transport_handles.push(None);
                    handle_cookie_reply(&device, &sent_mac1, data);
                }
                _ => {
                    transport_handles.push(None);
                    tracing::trace!(?from, "dropped datagram of unknown message type");
                }
            }
        }

        // Decryption for this batch runs concurrently across the spawned
        // tasks above; results are delivered to the tunnel in the order
        // the datagrams were read, preserving per-socket read ordering
        // even though the AEAD work itself overlaps.
        for handle in transport_handles {
            let Some(handle) = handle else { continue };
            let Ok((result, metrics)) = handle.await else { continue };
            match result {
                Ok(delivered) => {
                    Metrics::inc(&metrics.rx_packets);
                    if !delivered.plaintext.is_empty() {
                        let mut buffers = [delivered.plaintext];
                        if let Err(err) = tun.write(&buffers, 0).await {
                            tracing::debug!(?err, "tun write failed");
                        }
                        buffers[0].clear();
                    }
                }
                Err(ProtocolError::Replayed) => Metrics::inc(&metrics.packets_dropped_replay),
                Err(ProtocolError::AuthenticationFailed) => Metrics::inc(&metrics.packets_dropped_auth),
                Err(ProtocolError::UnknownIndex) => Metrics::inc(&metrics.packets_dropped_allowed_ips),
                Err(err) => tracing::debug!(?err, "inbound transport packet dropped"),
            }
        }
    }
}

fn handle_handshake_message(
    device: &Arc<Device>,
    metrics: &Arc<Metrics>,
    raw_tx: &mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    sent_mac1: &Arc<DashMap<u32, [u8; 16]>>,
    from: SocketAddr,
    data: &[u8],
) {
    match wire::peek_message_type(data) {
        Some(MESSAGE_TYPE_INITIATION) => {
            let Some(msg) = Initiation::from_bytes(data) else { return };
            match device.handle_incoming_initiation(&msg, from.ip()) {
                Ok((response, _peer)) => {
                    // Our Response carries its own MAC1/MAC2 and can itself
                    // draw a CookieReply from an initiator that considers
                    // itself under load.
                    sent_mac1.insert(response.sender_index, response.mac1);
                    let _ = raw_tx.send((from, response.to_bytes().to_vec()));
                    Metrics::inc(&metrics.handshakes_completed);
                }
                Err(ProtocolError::CookieRequired) => {
                    let (nonce, encrypted_cookie) =
                        device.cookie_checker.seal_cookie_reply(from.ip(), &msg.mac1);
                    let reply = CookieReply { receiver_index: msg.sender_index, nonce, encrypted_cookie };
                    let _ = raw_tx.send((from, reply.to_bytes().to_vec()));
                    Metrics::inc(&metrics.cookie_replies_sent);
                }
                Err(err) => {
                    tracing::debug!(?err, ?from, "rejected handshake initiation");
                    Metrics::inc(&metrics.handshakes_failed);
                }
            }
        }
        Some(MESSAGE_TYPE_RESPONSE) => {
            let Some(msg) = Response::from_bytes(data) else { return };
            match device.handle_incoming_response(&msg) {
                Ok(peer) => {
                    peer.set_endpoint(from);
                    sent_mac1.remove(&msg.receiver_index);
                    Metrics::inc(&metrics.handshakes_completed);
                }
                Err(err) => {
                    tracing::debug!(?err, ?from, "rejected handshake response");
                    Metrics::inc(&metrics.handshakes_failed);
                }
            }
        }
        _ => {}
    }
}

/// A `CookieReply`'s `receiver_index` echoes the local index we sent our
/// challenged message under; `sent_mac1` is how that message's MAC1 (the
/// AAD the cookie was encrypted against) survives long enough to decrypt
/// the reply (spec.md §4.3).
fn handle_cookie_reply(device: &Arc<Device>, sent_mac1: &Arc<DashMap<u32, [u8; 16]>>, data: &[u8]) {
    let Some(msg) = CookieReply::from_bytes(data) else { return };
    let Some(peer) = device.peer_for_index(msg.receiver_index) else { return };
    let Some((_, our_mac1)) = sent_mac1.remove(&msg.receiver_index) else { return };
    if !peer.cookie_jar.receive(&msg.nonce, &msg.encrypted_cookie, &our_mac1) {
        tracing::debug!("cookie reply failed to decrypt, ignoring");
    }
}

async fn tun_reader_loop<T: Tun>(
    device: Arc<Device>,
    tun: Arc<T>,
    outbound: Arc<OutboundPipeline<UdpSink>>,
    metrics: Arc<Metrics>,
    raw_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    sent_mac1: Arc<DashMap<u32, [u8; 16]>>,
) {
    let batch_size = tun.batch_size().max(1);
    let offset = 0usize;
    let mut buffers: Vec<Vec<u8>> = (0..batch_size).map(|_| vec![0u8; 2048]).collect();
    let mut sizes = vec![0usize; batch_size];

    loop {
        let n = match tun.read(&mut buffers, &mut sizes, offset).await {
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(?err, "tun read failed");
                continue;
            }
        };

        for i in 0..n {
            let frame = &buffers[i][offset..offset + sizes[i]];
            let Some(dest) = extract_dest_ip(frame) else { continue };
            let Some(peer) = device.peer_for_destination(dest) else {
                tracing::trace!(?dest, "dropped outbound packet with no allowed-ips match");
                continue;
            };

            if !peer.has_live_session() {
                maybe_initiate_handshake(&device, &peer, &metrics, &raw_tx, &sent_mac1);
                continue;
            }

            match outbound.send(&device, &peer, frame).await {
                Ok(()) => Metrics::inc(&metrics.tx_packets),
                Err(err) => tracing::debug!(?err, "outbound send failed"),
            }
        }
    }
}

fn maybe_initiate_handshake(
    device: &Arc<Device>,
    peer: &Arc<Peer>,
    metrics: &Arc<Metrics>,
    raw_tx: &mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    sent_mac1: &Arc<DashMap<u32, [u8; 16]>>,
) {
    let now = wireguard_proto::util::now_ms();
    if peer.handshake.lock().is_some() {
        return; // already in flight; the timer loop handles retransmits.
    }
    if now.saturating_sub(peer.last_initiation_sent_at()) < REKEY_TIMEOUT_MS {
        return;
    }
    let Some(endpoint) = peer.endpoint() else { return };
    match device.begin_handshake(peer) {
        Ok(msg) => {
            sent_mac1.insert(msg.sender_index, msg.mac1);
            let _ = raw_tx.send((endpoint, msg.to_bytes().to_vec()));
            Metrics::inc(&metrics.handshakes_initiated);
        }
        Err(err) => tracing::debug!(?err, "failed to begin handshake"),
    }
}

async fn timer_loop(
    device: Arc<Device>,
    outbound: Arc<OutboundPipeline<UdpSink>>,
    metrics: Arc<Metrics>,
    raw_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    sent_mac1: Arc<DashMap<u32, [u8; 16]>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = wireguard_proto::util::now_ms();
        for peer in device.peers() {
            // Timer 1/2: retransmit a handshake that has not been answered,
            // giving up after REKEY_ATTEMPT_TIME_MS of attempts.
            let retry = {
                let pending = peer.handshake.lock();
                pending.as_ref().map(|p| now - p.sent_at_ms >= REKEY_TIMEOUT_MS)
            };
            if let Some(true) = retry {
                if now.saturating_sub(peer.last_initiation_sent_at()) < REKEY_ATTEMPT_TIME_MS {
                    if let Some(endpoint) = peer.endpoint() {
                        *peer.handshake.lock() = None;
                        if let Ok(msg) = device.begin_handshake(&peer) {
                            sent_mac1.insert(msg.sender_index, msg.mac1);
                            let _ = raw_tx.send((endpoint, msg.to_bytes().to_vec()));
                            Metrics::inc(&metrics.handshakes_initiated);
                        }
                    }
                } else {
                    *peer.handshake.lock() = None;
                }
            }

            // Timer: new-handshake. As initiator, proactively rekey once
            // the current keypair is old enough or has sent enough
            // messages, rather than waiting for REJECT_AFTER_TIME to force
            // a hard cutover (spec.md §4.7).
            if let Some(kp) = peer.current_keypair() {
                if kp.is_initiator
                    && peer.handshake.lock().is_none()
                    && (kp.age_ms(now) >= REKEY_AFTER_TIME_MS || kp.current_send_counter() >= REKEY_AFTER_MESSAGES)
                    && now.saturating_sub(peer.last_initiation_sent_at()) >= REKEY_TIMEOUT_MS
                {
                    if let Some(endpoint) = peer.endpoint() {
                        if let Ok(msg) = device.begin_handshake(&peer) {
                            sent_mac1.insert(msg.sender_index, msg.mac1);
                            let _ = raw_tx.send((endpoint, msg.to_bytes().to_vec()));
                            Metrics::inc(&metrics.handshakes_initiated);
                        }
                    }
                }
            }

            // Timer 3: persistent keepalive.
            if let Some(interval_ms) = *peer.persistent_keepalive_interval_ms.read() {
                if now.saturating_sub(peer.last_sent_packet_at()) >= interval_ms && peer.has_live_session() {
                    let _ = outbound.send_keepalive(&device, &peer).await;
                }
            }

            // Timer 4: hard keypair expiry.
            peer.keypairs.lock().drop_expired(now);

            // Timer 5: passive keepalive after receive-without-send.
            if peer.has_live_session()
                && peer.last_received_packet_at() > peer.last_sent_packet_at()
                && now.saturating_sub(peer.last_received_packet_at()) >= KEEPALIVE_TIMEOUT_MS
            {
                let _ = outbound.send_keepalive(&device, &peer).await;
            }
        }
    }
}

fn extract_dest_ip(packet: &[u8]) -> Option<IpAddr> {
    let version = packet.first()? >> 4;
    match version {
        4 if packet.len() >= 20 => {
            let mut o = [0u8; 4];
            o.copy_from_slice(&packet[16..20]);
            Some(IpAddr::V4(Ipv4Addr::from(o)))
        }
        6 if packet.len() >= 40 => {
            let mut o = [0u8; 16];
            o.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(o)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{LoopbackNetwork, LoopbackTun, LoopbackUdp};
    use std::sync::atomic::Ordering;
    use std::time::Duration as StdDuration;
    use wireguard_crypto::dh::KeyPair;
    use wireguard_proto::DeviceState;

    async fn wait_for<F: Fn() -> bool>(cond: F, timeout: StdDuration) {
        let start = std::time::Instant::now();
        while !cond() {
            if start.elapsed() > timeout {
                panic!("condition not met within timeout");
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn baseline_round_trip_through_two_engines() {
        let a = Arc::new(Device::new(KeyPair::generate()));
        let b = Arc::new(Device::new(KeyPair::generate()));
        a.set_state(DeviceState::Up);
        b.set_state(DeviceState::Up);

        let peer_on_a = a.add_peer(b.public_key(), [0u8; 32], &[("10.0.0.2".parse().unwrap(), 32)]);
        let peer_on_b = b.add_peer(a.public_key(), [0u8; 32], &[("10.0.0.1".parse().unwrap(), 32)]);

        let network = LoopbackNetwork::new();
        let udp_a = Arc::new(LoopbackUdp::new(network.clone()));
        let udp_b = Arc::new(LoopbackUdp::new(network));
        let tun_a = Arc::new(LoopbackTun::new(1420));
        let tun_b = Arc::new(LoopbackTun::new(1420));

        let config = EngineConfig { timer_interval_ms: 10, ..Default::default() };
        let engine_a = Engine::start(a.clone(), tun_a.clone(), udp_a.clone(), config).await.unwrap();
        let port_a = udp_a.bound_port().unwrap();
        let engine_b = Engine::start(b.clone(), tun_b.clone(), udp_b.clone(), config).await.unwrap();
        let port_b = udp_b.bound_port().unwrap();

        peer_on_a.set_endpoint(format!("127.0.0.1:{port_b}").parse().unwrap());
        peer_on_b.set_endpoint(format!("127.0.0.1:{port_a}").parse().unwrap());

        // S1 baseline: a plaintext packet injected at A's tunnel arrives
        // unchanged at B's, and the reply arrives unchanged back at A's.
        let ping = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"ping-payload");
        tun_a.inject(ping.clone());

        wait_for(|| !tun_b.written().is_empty(), StdDuration::from_secs(2)).await;
        let received = tun_b.written();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], ping);

        let pong = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], b"pong-payload");
        tun_b.inject(pong.clone());
        wait_for(|| !tun_a.written().is_empty(), StdDuration::from_secs(2)).await;
        let received_back = tun_a.written();
        assert_eq!(received_back.len(), 1);
        assert_eq!(received_back[0], pong);

        assert!(peer_on_a.has_live_session());
        assert!(peer_on_b.has_live_session());

        engine_a.shutdown();
        engine_b.shutdown();
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 20 + payload.len()];
        pkt[0] = 0x45;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt[20..].copy_from_slice(payload);
        pkt
    }

    #[tokio::test]
    async fn new_handshake_timer_fires_once_send_counter_crosses_rekey_after_messages() {
        let a = Arc::new(Device::new(KeyPair::generate()));
        let b = Arc::new(Device::new(KeyPair::generate()));
        a.set_state(DeviceState::Up);
        b.set_state(DeviceState::Up);

        let peer_on_a = a.add_peer(b.public_key(), [0u8; 32], &[]);
        b.add_peer(a.public_key(), [0u8; 32], &[("10.0.0.1".parse().unwrap(), 32)]);

        let init_msg = a.begin_handshake(&peer_on_a).unwrap();
        let (resp_msg, _) = b.handle_incoming_initiation(&init_msg, "127.0.0.1".parse().unwrap()).unwrap();
        a.handle_incoming_response(&resp_msg).unwrap();
        peer_on_a.set_endpoint("127.0.0.1:51820".parse().unwrap());
        assert!(peer_on_a.has_live_session());

        // Fast-forward past the rekey-by-count threshold without actually
        // sending 2^60 packets, and backdate the last initiation so the
        // debounce in `send_handshake_initiation` (spec.md §4.7) doesn't
        // suppress the new one.
        peer_on_a
            .current_keypair()
            .unwrap()
            .send_counter
            .store(wireguard_proto::constants::REKEY_AFTER_MESSAGES, Ordering::Relaxed);
        peer_on_a.note_initiation_sent(
            wireguard_proto::util::now_ms() - wireguard_proto::constants::REKEY_TIMEOUT_MS - 1_000,
        );

        let network = LoopbackNetwork::new();
        let udp_a = Arc::new(LoopbackUdp::new(network));
        let tun_a = Arc::new(LoopbackTun::new(1420));
        let config = EngineConfig { timer_interval_ms: 10, ..Default::default() };
        let engine_a = Engine::start(a.clone(), tun_a, udp_a, config).await.unwrap();

        wait_for(|| peer_on_a.handshake.lock().is_some(), StdDuration::from_secs(2)).await;
        assert!(engine_a.metrics.handshakes_initiated.load(Ordering::Relaxed) >= 1);

        engine_a.shutdown();
    }
}
