/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Outbound transport encryption, spec.md §4.5: pad, seal, frame, and
 * deliver in the order packets were handed to the pipeline even though the
 * AEAD work for several packets may run concurrently.
 */

use std::sync::Arc;

use dashmap::DashMap;
use wireguard_crypto::aead::{seal_in_place, TAG_SIZE};

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::peer::Peer;
use crate::util::now_ms;
use crate::wire::{padded_len, TransportHeader, TRANSPORT_HEADER_LEN};

use super::{OrderingGate, PacketSink};

pub struct OutboundPipeline<S: PacketSink> {
    sink: Arc<S>,
    gates: DashMap<u32, Arc<OrderingGate>>,
}

impl<S: PacketSink> OutboundPipeline<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink, gates: DashMap::new() }
    }

    fn gate_for(&self, local_index: u32) -> Arc<OrderingGate> {
        self.gates.entry(local_index).or_insert_with(|| Arc::new(OrderingGate::new())).clone()
    }

    /// Encrypt and send one plaintext IP packet to `peer`. Safe to call
    /// concurrently for the same peer from multiple tasks: each call
    /// reserves its own send counter up front, so concurrent callers
    /// encrypt in parallel but still write to the socket in the order
    /// their counters were reserved.
    pub async fn send(&self, device: &Device, peer: &Arc<Peer>, plaintext: &[u8]) -> Result<()> {
        let kp = peer.current_keypair().ok_or(ProtocolError::NoSession)?;
        let now = now_ms();
        if kp.is_expired(now) {
            return Err(ProtocolError::KeypairExpired);
        }
        let counter = kp.next_send_counter().ok_or(ProtocolError::KeypairExpired)?;

        let mtu = *device.mtu.read();
        let padded = padded_len(plaintext.len(), mtu);
        let mut packet = vec![0u8; TRANSPORT_HEADER_LEN + padded + TAG_SIZE];
        packet[TRANSPORT_HEADER_LEN..TRANSPORT_HEADER_LEN + plaintext.len()].copy_from_slice(plaintext);
        TransportHeader { receiver_index: kp.remote_index, counter }.write(&mut packet[..TRANSPORT_HEADER_LEN]);
        seal_in_place(kp.send_key.as_bytes(), counter, &[], &mut packet[TRANSPORT_HEADER_LEN..], padded);

        let gate = self.gate_for(kp.local_index);
        gate.wait_for(counter).await;
        let result = match peer.endpoint() {
            Some(endpoint) => self.sink.send_to(endpoint, &packet).map_err(|_| ProtocolError::NoSession),
            None => Err(ProtocolError::NoSession),
        };
        gate.advance();

        if result.is_ok() {
            peer.note_packet_sent(now_ms());
            peer.tx_bytes.fetch_add(plaintext.len() as u64, std::sync::atomic::Ordering::Relaxed);
        }
        result
    }

    /// Send an empty keepalive, bypassing padding (there is no payload to pad).
    pub async fn send_keepalive(&self, device: &Device, peer: &Arc<Peer>) -> Result<()> {
        self.send(device, peer, &[]).await
    }

    pub fn forget(&self, local_index: u32) {
        self.gates.remove(&local_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use wireguard_crypto::dh::KeyPair;

    struct RecordingSink {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl PacketSink for RecordingSink {
        fn send_to(&self, dest: SocketAddr, data: &[u8]) -> std::io::Result<()> {
            self.sent.lock().push((dest, data.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_without_session_fails_cleanly() {
        let device = Device::new(KeyPair::generate());
        let peer = device.add_peer([9u8; 32], [0u8; 32], &[]);
        let sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()) });
        let pipeline = OutboundPipeline::new(sink);
        let result = pipeline.send(&device, &peer, b"hello").await;
        assert!(matches!(result, Err(ProtocolError::NoSession)));
    }

    #[tokio::test]
    async fn successive_sends_carry_strictly_increasing_counters() {
        let initiator = Device::new(KeyPair::generate());
        let responder = Device::new(KeyPair::generate());
        let initiator_peer = initiator.add_peer(responder.public_key(), [0u8; 32], &[]);

        let init_msg = initiator.begin_handshake(&initiator_peer).unwrap();
        let (resp_msg, _) = responder
            .handle_incoming_initiation(&init_msg, "127.0.0.1".parse().unwrap())
            .unwrap();
        initiator.handle_incoming_response(&resp_msg).unwrap();
        initiator_peer.set_endpoint("127.0.0.1:9".parse().unwrap());

        let sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()) });
        let pipeline = OutboundPipeline::new(sink.clone());

        for i in 0..8u8 {
            pipeline.send(&initiator, &initiator_peer, &[i]).await.unwrap();
        }

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 8);
        for (i, (_, data)) in sent.iter().enumerate() {
            let header = TransportHeader::read(data).unwrap();
            assert_eq!(header.counter, i as u64);
        }
    }
}
