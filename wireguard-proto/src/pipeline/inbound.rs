/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Inbound transport decryption, spec.md §4.6: authenticate, replay-check,
 * confirm keypair rotation, and enforce Cryptokey Routing on the decrypted
 * packet's source address before it is allowed out to the TUN device.
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use dashmap::DashMap;
use wireguard_crypto::aead::open_in_place;

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::peer::Peer;
use crate::util::now_ms;
use crate::wire::TransportHeader;

use super::OrderingGate;

/// A decrypted packet ready for delivery to the TUN device, already
/// source-address-checked against the sending peer's allowed-ips.
pub struct Delivered {
    pub peer: std::sync::Arc<Peer>,
    pub plaintext: Vec<u8>,
}

pub struct InboundPipeline {
    gates: DashMap<u32, std::sync::Arc<OrderingGate>>,
}

impl Default for InboundPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundPipeline {
    pub fn new() -> Self {
        Self { gates: DashMap::new() }
    }

    fn gate_for(&self, local_index: u32) -> std::sync::Arc<OrderingGate> {
        self.gates.entry(local_index).or_insert_with(|| std::sync::Arc::new(OrderingGate::new())).clone()
    }

    /// Decrypt one transport datagram received from `from`. Ordering is
    /// enforced per keypair: concurrent calls for the same keypair
    /// authenticate and decrypt in parallel but only the in-order ones are
    /// delivered, matching the sequencing `OutboundPipeline` applies on
    /// the send side.
    pub async fn receive(&self, device: &Device, from: SocketAddr, datagram: &[u8]) -> Result<Delivered> {
        let header = TransportHeader::read(datagram).ok_or(ProtocolError::Malformed)?;
        let (peer, kp) = device.keypair_for_index(header.receiver_index).ok_or(ProtocolError::UnknownIndex)?;

        let now = now_ms();
        if kp.is_expired(now) {
            tracing::debug!(?from, local_index = kp.local_index, "rejected transport packet on expired keypair");
            return Err(ProtocolError::KeypairExpired);
        }

        if header.counter >= wireguard_crypto_replay_ceiling() {
            tracing::warn!(?from, counter = header.counter, "rejected transport packet past replay ceiling");
            return Err(ProtocolError::Replayed);
        }

        {
            let mut replay = kp.replay.lock();
            if !replay.check_and_mark(header.counter) {
                tracing::debug!(?from, counter = header.counter, "rejected replayed transport packet");
                return Err(ProtocolError::Replayed);
            }
        }

        let mut buf = datagram[crate::wire::TRANSPORT_HEADER_LEN..].to_vec();
        let pt_len = open_in_place(kp.recv_key.as_bytes(), header.counter, &[], &mut buf).ok_or_else(|| {
            tracing::debug!(?from, counter = header.counter, "transport packet failed authentication");
            ProtocolError::AuthenticationFailed
        })?;
        buf.truncate(pt_len);

        let gate = self.gate_for(kp.local_index);
        gate.wait_for(header.counter).await;

        let now = now_ms();
        peer.set_endpoint(from);
        peer.note_packet_received(now);
        peer.rx_bytes.fetch_add(buf.len() as u64, std::sync::atomic::Ordering::Relaxed);
        if !kp.is_initiator {
            // The responder's keypair is confirmed live the moment any
            // authenticated transport packet decrypts under it; promote a
            // pending `next` generation if this is it (spec.md §3).
            peer.keypairs.lock().rotate_in_next();
        }

        gate.advance();

        if !buf.is_empty() {
            if let Some(source) = extract_source_ip(&buf) {
                let bound_to_sender = device
                    .allowed_ips
                    .lookup(source)
                    .map(|h| std::sync::Arc::ptr_eq(&h.0, &peer))
                    .unwrap_or(false);
                if !bound_to_sender {
                    tracing::warn!(?from, ?source, "dropped packet with source not bound to sending peer");
                    return Err(ProtocolError::UnknownIndex);
                }
            }
        }

        Ok(Delivered { peer, plaintext: buf })
    }

    pub fn forget(&self, local_index: u32) {
        self.gates.remove(&local_index);
    }
}

fn wireguard_crypto_replay_ceiling() -> u64 {
    crate::constants::REJECT_AFTER_MESSAGES
}

/// Pull the source address out of a raw IPv4/IPv6 packet for ingress
/// Cryptokey Routing enforcement (spec.md §4.1).
fn extract_source_ip(packet: &[u8]) -> Option<IpAddr> {
    let version = packet.first()? >> 4;
    match version {
        4 if packet.len() >= 20 => {
            let mut o = [0u8; 4];
            o.copy_from_slice(&packet[12..16]);
            Some(IpAddr::V4(Ipv4Addr::from(o)))
        }
        6 if packet.len() >= 40 => {
            let mut o = [0u8; 16];
            o.copy_from_slice(&packet[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(o)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::ReplayFilter;
    use crate::pipeline::outbound::OutboundPipeline;
    use crate::pipeline::PacketSink;
    use parking_lot::Mutex;
    use wireguard_crypto::dh::KeyPair;

    struct LoopbackSink {
        last: Mutex<Option<(SocketAddr, Vec<u8>)>>,
    }

    impl PacketSink for LoopbackSink {
        fn send_to(&self, dest: SocketAddr, data: &[u8]) -> std::io::Result<()> {
            *self.last.lock() = Some((dest, data.to_vec()));
            Ok(())
        }
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 20 + payload.len()];
        pkt[0] = 0x45;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt[20..].copy_from_slice(payload);
        pkt
    }

    #[tokio::test]
    async fn round_trips_a_packet_end_to_end_and_enforces_allowed_ips() {
        let initiator = Device::new(KeyPair::generate());
        let responder = Device::new(KeyPair::generate());
        let initiator_peer = initiator.add_peer(responder.public_key(), [0u8; 32], &[]);
        let responder_peer = responder.add_peer(
            initiator.public_key(),
            [0u8; 32],
            &[("10.0.0.2".parse().unwrap(), 32)],
        );
        let init_msg = initiator.begin_handshake(&initiator_peer).unwrap();
        let (resp_msg, _) = responder
            .handle_incoming_initiation(&init_msg, "127.0.0.1".parse().unwrap())
            .unwrap();
        initiator.handle_incoming_response(&resp_msg).unwrap();
        initiator_peer.set_endpoint("127.0.0.1:51820".parse().unwrap());

        let sink = std::sync::Arc::new(LoopbackSink { last: Mutex::new(None) });
        let outbound = OutboundPipeline::new(sink.clone());
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], b"hi");
        outbound.send(&initiator, &initiator_peer, &packet).await.unwrap();

        let (from, datagram) = sink.last.lock().take().unwrap();
        let inbound = InboundPipeline::new();
        let delivered = inbound.receive(&responder, from, &datagram).await.unwrap();
        assert!(std::sync::Arc::ptr_eq(&delivered.peer, &responder_peer));
        assert_eq!(&delivered.plaintext[..packet.len()], &packet[..]);
    }

    #[tokio::test]
    async fn rejects_packet_with_spoofed_source_not_in_allowed_ips() {
        let initiator = Device::new(KeyPair::generate());
        let responder = Device::new(KeyPair::generate());
        let initiator_peer = initiator.add_peer(responder.public_key(), [0u8; 32], &[]);
        responder.add_peer(
            initiator.public_key(),
            [0u8; 32],
            &[("10.0.0.2".parse().unwrap(), 32)],
        );

        let init_msg = initiator.begin_handshake(&initiator_peer).unwrap();
        let (resp_msg, _) = responder
            .handle_incoming_initiation(&init_msg, "127.0.0.1".parse().unwrap())
            .unwrap();
        initiator.handle_incoming_response(&resp_msg).unwrap();
        initiator_peer.set_endpoint("127.0.0.1:51820".parse().unwrap());

        let sink = std::sync::Arc::new(LoopbackSink { last: Mutex::new(None) });
        let outbound = OutboundPipeline::new(sink.clone());
        // Spoofed source: 10.0.0.9 is not in the responder's allowed-ips for this peer.
        let packet = ipv4_packet([10, 0, 0, 9], [10, 0, 0, 1], b"hi");
        outbound.send(&initiator, &initiator_peer, &packet).await.unwrap();

        let (from, datagram) = sink.last.lock().take().unwrap();
        let inbound = InboundPipeline::new();
        let result = inbound.receive(&responder, from, &datagram).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_transport_packet_on_keypair_past_reject_after_time() {
        let initiator = Device::new(KeyPair::generate());
        let responder = Device::new(KeyPair::generate());
        let initiator_peer = initiator.add_peer(responder.public_key(), [0u8; 32], &[]);
        responder.add_peer(
            initiator.public_key(),
            [0u8; 32],
            &[("10.0.0.2".parse().unwrap(), 32)],
        );

        let init_msg = initiator.begin_handshake(&initiator_peer).unwrap();
        let (resp_msg, _) = responder
            .handle_incoming_initiation(&init_msg, "127.0.0.1".parse().unwrap())
            .unwrap();
        initiator.handle_incoming_response(&resp_msg).unwrap();
        initiator_peer.set_endpoint("127.0.0.1:51820".parse().unwrap());

        let sink = std::sync::Arc::new(LoopbackSink { last: Mutex::new(None) });
        let outbound = OutboundPipeline::new(sink.clone());
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], b"hi");
        outbound.send(&initiator, &initiator_peer, &packet).await.unwrap();
        let (from, datagram) = sink.last.lock().take().unwrap();

        // Backdate the responder's installed keypair past REJECT_AFTER_TIME
        // so the inbound path must treat it as expired rather than decrypting.
        {
            let responder_peer = responder.peer_by_pubkey(&initiator.public_key()).unwrap();
            let mut slots = responder_peer.keypairs.lock();
            let old = slots.current.take().unwrap();
            let backdated = crate::keypair::Keypair {
                local_index: old.local_index,
                remote_index: old.remote_index,
                send_key: old.send_key.clone(),
                recv_key: old.recv_key.clone(),
                is_initiator: old.is_initiator,
                created_at_ms: old.created_at_ms - (crate::constants::REJECT_AFTER_TIME_MS + 1_000),
                send_counter: std::sync::atomic::AtomicU64::new(old.current_send_counter()),
                replay: parking_lot::Mutex::new(ReplayFilter::new()),
            };
            slots.current = Some(std::sync::Arc::new(backdated));
        }

        let inbound = InboundPipeline::new();
        let result = inbound.receive(&responder, from, &datagram).await;
        assert_eq!(result.unwrap_err(), ProtocolError::KeypairExpired);
    }
}
