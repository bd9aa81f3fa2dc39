/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Device: local identity, peer set, Cryptokey Routing table, and the
 * handshake orchestration that ties noise.rs/keypair.rs/cookie.rs/peer.rs
 * together into the operations spec.md §3/§5 describes. Grounded on
 * `zerotier-network-hypervisor/src/vl1/node.rs` (`DashMap` peer set,
 * `RwLock`-guarded mutable groups, interval-driven background maintenance)
 * generalized from VL1's node-identity model to a single WireGuard static
 * identity plus its configured peer set.
 */

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use wireguard_crypto::dh::KeyPair;

use crate::constants::HANDSHAKE_INITIATION_RATE_MS;
use crate::cookie::{CookieChecker, RateLimiter};
use crate::error::{ProtocolError, Result};
use crate::index_table::{IndexEntry, IndexTable};
use crate::keypair::Keypair as SessionKeypair;
use crate::noise;
use crate::peer::{PendingHandshake, Peer};
use crate::trie::{AllowedIps, Prefix};
use crate::util::now_ms;
use crate::wire::{Initiation, Response};

/// Wraps `Arc<Peer>` with pointer-identity equality/hash so it can be used
/// as the value type of [`AllowedIps`] and [`IndexTable`] without requiring
/// `Peer` itself to implement `Eq`/`Hash` over its mutable fields.
#[derive(Clone)]
pub struct PeerHandle(pub Arc<Peer>);

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PeerHandle {}
impl std::hash::Hash for PeerHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

/// Device power state, spec.md §5.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize)]
pub enum DeviceState {
    Down,
    Up,
    Closed,
}

pub struct Device {
    static_keypair: RwLock<KeyPair>,
    state: RwLock<DeviceState>,
    pub mtu: RwLock<usize>,
    /// UDP bind port, spec.md §4.8's `listen_port`. Purely bookkeeping here;
    /// actually rebinding the socket is the runtime layer's job (§5 "net
    /// state" is device-owned data, not device-owned I/O).
    pub listen_port: RwLock<u16>,
    /// `SO_MARK`/`fwmark` value requested via the config protocol; applied to
    /// the real socket by the runtime layer through `Udp::set_mark`.
    pub fwmark: RwLock<u32>,

    peers_by_pubkey: DashMap<[u8; 32], PeerHandle>,
    index_table: IndexTable<PeerHandle, PeerHandle>,
    pub allowed_ips: AllowedIps<PeerHandle>,

    pub cookie_checker: CookieChecker,
    pub rate_limiter: RateLimiter,
}

impl Device {
    pub fn new(static_keypair: KeyPair) -> Self {
        let our_public = static_keypair.public_bytes();
        Self {
            static_keypair: RwLock::new(static_keypair),
            state: RwLock::new(DeviceState::Down),
            mtu: RwLock::new(1420),
            listen_port: RwLock::new(0),
            fwmark: RwLock::new(0),
            peers_by_pubkey: DashMap::new(),
            index_table: IndexTable::new(),
            allowed_ips: AllowedIps::new(),
            cookie_checker: CookieChecker::new(our_public),
            rate_limiter: RateLimiter::new(),
        }
    }

    /// The local static public key, the only part of the identity safe to
    /// expose outside this module.
    pub fn public_key(&self) -> [u8; 32] {
        self.static_keypair.read().public_bytes()
    }

    /// The local static private key. Exposed only for the config protocol's
    /// `get` response, which is served solely on a trusted local endpoint
    /// (spec.md §4.8).
    pub fn private_key(&self) -> [u8; 32] {
        self.static_keypair.read().private_bytes()
    }

    /// Replace the local static identity. Per spec.md §3: invalidates every
    /// peer's in-flight handshake and live keypairs (forcing a rehandshake),
    /// and removes any peer whose public key now equals our own (self-loop
    /// prevention applies retroactively too, not just at `add_peer` time).
    pub fn set_private_key(&self, static_keypair: KeyPair) {
        let new_public = static_keypair.public_bytes();
        *self.static_keypair.write() = static_keypair;
        self.cookie_checker.set_local_static_public(new_public);

        self.remove_peer(&new_public);
        for peer in self.peers() {
            *peer.handshake.lock() = None;
            peer.keypairs.lock().clear();
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    pub fn set_state(&self, s: DeviceState) {
        *self.state.write() = s;
    }

    /// Add or replace a peer, keyed by its static public key. Replacing an
    /// existing peer drops its previous allowed-ips bindings but not its
    /// index-table entries, which expire naturally as handshakes/keypairs do.
    pub fn add_peer(&self, static_public: [u8; 32], preshared_key: [u8; 32], allowed: &[(IpAddr, u8)]) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(static_public, preshared_key));
        let handle = PeerHandle(peer.clone());
        if let Some(old) = self.peers_by_pubkey.insert(static_public, handle.clone()) {
            self.allowed_ips.remove_all(&old);
        }
        for (addr, len) in allowed {
            if let Some(prefix) = Prefix::new(*addr, *len) {
                self.allowed_ips.insert(prefix, handle.clone());
            }
        }
        peer
    }

    pub fn remove_peer(&self, static_public: &[u8; 32]) {
        if let Some((_, handle)) = self.peers_by_pubkey.remove(static_public) {
            self.allowed_ips.remove_all(&handle);
        }
    }

    pub fn peer_by_pubkey(&self, static_public: &[u8; 32]) -> Option<Arc<Peer>> {
        self.peers_by_pubkey.get(static_public).map(|h| h.0.clone())
    }

    pub fn peer_for_destination(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.allowed_ips.lookup(addr).map(|h| h.0)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers_by_pubkey.iter().map(|e| e.value().0.clone()).collect()
    }

    /// Build an `Initiation` for `peer`, allocating a fresh local index and
    /// parking the in-progress handshake state on the peer (spec.md §4.4).
    pub fn begin_handshake(&self, peer: &Arc<Peer>) -> Result<Initiation> {
        let (mut msg, state) =
            noise::create_initiation(&self.static_keypair.read(), &peer.static_public, &peer.preshared_key())?;
        let handle = PeerHandle(peer.clone());
        let local_index = self.index_table.new_index(IndexEntry::Handshake(handle));
        msg.sender_index = local_index;
        msg.mac1 = crate::cookie::mac1(&peer.mac_keys.mac1_key, Initiation::mac1_covered(&msg.to_bytes()));
        if let Some(cookie) = peer.cookie_jar.current() {
            msg.mac2 = crate::cookie::mac2(&cookie, Initiation::mac2_covered(&msg.to_bytes()));
        }
        let now = now_ms();
        *peer.handshake.lock() = Some(PendingHandshake { local_index, state, sent_at_ms: now });
        peer.note_initiation_sent(now);
        Ok(msg)
    }

    /// Validate MAC1 (and MAC2, if under load) on an inbound initiation and
    /// complete the responder's side of the handshake, returning the
    /// `Response` to send back plus the peer it was for.
    pub fn handle_incoming_initiation(&self, msg: &Initiation, source: IpAddr) -> Result<(Response, Arc<Peer>)> {
        let bytes = msg.to_bytes();
        // MAC1 is keyed by our own static public key since we are the
        // recipient of this message.
        let our_mac1_key = wireguard_crypto::hash::hash(&[b"mac1----", &self.static_keypair.read().public_bytes()]);
        if !self.cookie_checker.verify_mac1(&our_mac1_key, Initiation::mac1_covered(&bytes), &msg.mac1) {
            tracing::debug!(?source, "rejected initiation with bad mac1");
            return Err(ProtocolError::BadMac1);
        }
        let now = now_ms();
        if self.cookie_checker.is_under_load(now)
            && !self.cookie_checker.verify_mac2(source, Initiation::mac2_covered(&bytes), &msg.mac2)
        {
            tracing::debug!(?source, "under load, requiring cookie for initiation");
            return Err(ProtocolError::CookieRequired);
        }
        if !self.rate_limiter.allow(source) {
            tracing::warn!(?source, "rate limiter rejected initiation");
            return Err(ProtocolError::CookieRequired);
        }

        let consumed = noise::consume_initiation(&self.static_keypair.read(), msg)?;
        let peer = self.peer_by_pubkey(&consumed.their_static_public).ok_or(ProtocolError::UnknownIndex)?;

        if consumed.timestamp <= peer.last_initiation_timestamp() {
            tracing::warn!(?source, "rejected initiation with stale or replayed timestamp");
            return Err(ProtocolError::StaleTimestamp);
        }
        // Flood protection (spec.md §4.4 step 4): an authentic initiation
        // from a peer we've *just* handshaked with is still rejected if it
        // arrives too soon after the last one we accepted.
        if now.saturating_sub(peer.last_initiation_consumed_ms()) <= HANDSHAKE_INITIATION_RATE_MS {
            tracing::warn!(?source, "rejected initiation: too soon after the last one from this peer");
            return Err(ProtocolError::InitiationFlood);
        }
        tracing::debug!(?source, sender_index = msg.sender_index, "accepted handshake initiation");
        peer.set_last_initiation_timestamp(consumed.timestamp);
        peer.note_initiation_consumed(now);
        peer.set_endpoint(source_to_socket(source, msg));

        let (mut response, keys) = noise::create_response(&consumed, &peer.preshared_key())?;
        let handle = PeerHandle(peer.clone());
        let local_index = self.index_table.new_index(IndexEntry::Keypair(handle));
        response.sender_index = local_index;
        response.receiver_index = msg.sender_index;
        response.mac1 =
            crate::cookie::mac1(&peer.mac_keys.mac1_key, Response::mac1_covered(&response.to_bytes()));
        if let Some(cookie) = peer.cookie_jar.current() {
            response.mac2 = crate::cookie::mac2(&cookie, Response::mac2_covered(&response.to_bytes()));
        }

        let kp = Arc::new(SessionKeypair::new(local_index, msg.sender_index, keys, false));
        peer.keypairs.lock().insert_new(kp);
        peer.note_handshake_completed(now);
        tracing::info!(?source, local_index, "handshake completed as responder");

        Ok((response, peer))
    }

    /// Complete the initiator's side after receiving a `Response` whose
    /// `receiver_index` matches a pending handshake.
    pub fn handle_incoming_response(&self, msg: &Response) -> Result<Arc<Peer>> {
        let owner = match self.index_table.lookup(msg.receiver_index) {
            Some(IndexEntry::Handshake(h)) => h,
            _ => return Err(ProtocolError::UnknownIndex),
        };
        let peer = owner.0;
        let bytes = msg.to_bytes();
        if !self.cookie_checker.verify_mac1(&peer.mac_keys.mac1_key, Response::mac1_covered(&bytes), &msg.mac1) {
            tracing::debug!(receiver_index = msg.receiver_index, "rejected response with bad mac1");
            return Err(ProtocolError::BadMac1);
        }

        let pending = peer.handshake.lock().take().ok_or(ProtocolError::OutOfOrder)?;
        if pending.local_index != msg.receiver_index {
            *peer.handshake.lock() = Some(pending);
            return Err(ProtocolError::OutOfOrder);
        }

        let keys = noise::consume_response(pending.state, &self.static_keypair.read(), msg, &peer.preshared_key())?;
        let kp = Arc::new(SessionKeypair::new(pending.local_index, msg.sender_index, keys, true));
        peer.keypairs.lock().insert_new(kp);
        // `pending.local_index` (== msg.receiver_index) now identifies a
        // live keypair rather than an in-progress handshake; repoint the
        // index table entry instead of deleting it so inbound transport
        // packets addressed to it still resolve.
        self.register_keypair_index(&peer, pending.local_index);
        peer.note_handshake_completed(now_ms());
        tracing::info!(local_index = pending.local_index, "handshake completed as initiator");
        Ok(peer)
    }

    /// Look up the keypair a transport packet's `receiver_index` refers to.
    pub fn keypair_for_index(&self, index: u32) -> Option<(Arc<Peer>, Arc<SessionKeypair>)> {
        match self.index_table.lookup(index)? {
            IndexEntry::Keypair(handle) => {
                let kp = handle.0.keypairs.lock().by_local_index(index).cloned()?;
                Some((handle.0, kp))
            }
            IndexEntry::Handshake(_) => None,
        }
    }

    /// Register a freshly negotiated keypair's local index in the device's
    /// index table so inbound transport packets can find it in O(1). Called
    /// once a handshake completes on either side.
    pub fn register_keypair_index(&self, peer: &Arc<Peer>, local_index: u32) {
        self.index_table.swap(local_index, IndexEntry::Keypair(PeerHandle(peer.clone())));
    }

    pub fn forget_index(&self, index: u32) {
        self.index_table.delete(index);
    }

    /// Resolve either a pending-handshake or a live-keypair index back to
    /// its owning peer, for routing an inbound `CookieReply` (which only
    /// carries the index we originally sent under) back to the right peer.
    pub fn peer_for_index(&self, index: u32) -> Option<Arc<Peer>> {
        match self.index_table.lookup(index)? {
            IndexEntry::Handshake(h) | IndexEntry::Keypair(h) => Some(h.0),
        }
    }

    /// A point-in-time, serializable view of device and peer state for
    /// `--dump-json` and integration tests, without exposing private fields
    /// (spec.md §4.9).
    pub fn debug_snapshot(&self) -> DeviceSnapshot {
        let peers = self
            .peers_by_pubkey
            .iter()
            .map(|e| {
                let peer = &e.value().0;
                PeerSnapshot {
                    public_key: hex::encode(peer.static_public),
                    endpoint: peer.endpoint().map(|a| a.to_string()),
                    has_live_session: peer.has_live_session(),
                    last_handshake_completed_ms: peer.last_handshake_completed_at(),
                    rx_bytes: peer.rx_bytes.load(std::sync::atomic::Ordering::Relaxed),
                    tx_bytes: peer.tx_bytes.load(std::sync::atomic::Ordering::Relaxed),
                }
            })
            .collect::<Vec<_>>();
        DeviceSnapshot {
            public_key: hex::encode(self.static_keypair.read().public_bytes()),
            state: self.state(),
            mtu: *self.mtu.read(),
            peer_count: peers.len(),
            peers,
        }
    }
}

#[derive(serde::Serialize)]
pub struct PeerSnapshot {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub has_live_session: bool,
    pub last_handshake_completed_ms: i64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(serde::Serialize)]
pub struct DeviceSnapshot {
    pub public_key: String,
    pub state: DeviceState,
    pub mtu: usize,
    pub peer_count: usize,
    pub peers: Vec<PeerSnapshot>,
}

fn source_to_socket(source: IpAddr, _msg: &Initiation) -> std::net::SocketAddr {
    // The UDP port is supplied by the runtime layer (wireguard-rt) that
    // actually received the datagram; callers in that layer overwrite the
    // endpoint with the full socket address immediately after this call.
    std::net::SocketAddr::new(source, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_device_handshake_establishes_keypairs_on_both_sides() {
        let initiator_device = Device::new(KeyPair::generate());
        let responder_device = Device::new(KeyPair::generate());

        let responder_public = responder_device.public_key();
        let initiator_public = initiator_device.public_key();

        let initiator_peer = initiator_device.add_peer(responder_public, [0u8; 32], &[]);
        let responder_peer = responder_device.add_peer(initiator_public, [0u8; 32], &[]);

        let initiation = initiator_device.begin_handshake(&initiator_peer).unwrap();
        let source: IpAddr = "127.0.0.1".parse().unwrap();

        let (response, peer_on_responder) =
            responder_device.handle_incoming_initiation(&initiation, source).unwrap();
        assert!(Arc::ptr_eq(&peer_on_responder, &responder_peer));

        let peer_on_initiator = initiator_device.handle_incoming_response(&response).unwrap();
        assert!(Arc::ptr_eq(&peer_on_initiator, &initiator_peer));

        assert!(initiator_peer.has_live_session());
        assert!(responder_peer.has_live_session());
    }

    #[test]
    fn initiation_with_bad_mac1_is_rejected() {
        let responder_device = Device::new(KeyPair::generate());
        let initiator_static = KeyPair::generate();
        responder_device.add_peer(initiator_static.public_bytes(), [0u8; 32], &[]);

        let (mut msg, _state) =
            noise::create_initiation(&initiator_static, &responder_device.public_key(), &[0u8; 32])
                .unwrap();
        msg.mac1 = [0xffu8; 16];
        let source: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(responder_device.handle_incoming_initiation(&msg, source).is_err());
    }

    #[test]
    fn rapid_reinitiation_from_same_peer_is_flood_rejected() {
        // spec.md §4.4 step 4: an initiation arriving within
        // HANDSHAKE_INITIATION_RATE of the last one accepted from this peer
        // is rejected even though its MAC1/timestamp are otherwise valid.
        let initiator_device = Device::new(KeyPair::generate());
        let responder_device = Device::new(KeyPair::generate());
        let responder_public = responder_device.public_key();
        let initiator_public = initiator_device.public_key();
        let initiator_peer = initiator_device.add_peer(responder_public, [0u8; 32], &[]);
        responder_device.add_peer(initiator_public, [0u8; 32], &[]);

        let source: IpAddr = "127.0.0.1".parse().unwrap();
        let first = initiator_device.begin_handshake(&initiator_peer).unwrap();
        assert!(responder_device.handle_incoming_initiation(&first, source).is_ok());

        let second = initiator_device.begin_handshake(&initiator_peer).unwrap();
        let err = responder_device.handle_incoming_initiation(&second, source).unwrap_err();
        assert_eq!(err, ProtocolError::InitiationFlood);
    }

    #[test]
    fn under_load_demands_cookie_then_accepts_it() {
        // spec.md §8 S5: once the responder considers itself under load, an
        // initiation without a valid MAC2 is rejected; attaching the cookie
        // from the resulting CookieReply lets the same initiation through.
        let initiator_device = Device::new(KeyPair::generate());
        let responder_device = Device::new(KeyPair::generate());
        let responder_public = responder_device.public_key();
        let initiator_public = initiator_device.public_key();
        let initiator_peer = initiator_device.add_peer(responder_public, [0u8; 32], &[]);
        responder_device.add_peer(initiator_public, [0u8; 32], &[]);

        responder_device.cookie_checker.mark_under_load_if_needed(now_ms());
        assert!(responder_device.cookie_checker.is_under_load(now_ms()));

        let source: IpAddr = "198.51.100.9".parse().unwrap();
        let msg = initiator_device.begin_handshake(&initiator_peer).unwrap();
        let err = responder_device.handle_incoming_initiation(&msg, source).unwrap_err();
        assert_eq!(err, ProtocolError::CookieRequired);

        let (nonce, encrypted_cookie) =
            responder_device.cookie_checker.seal_cookie_reply(source, &msg.mac1);
        assert!(initiator_peer.cookie_jar.receive(&nonce, &encrypted_cookie, &msg.mac1));

        let mut retried = initiator_device.begin_handshake(&initiator_peer).unwrap();
        let cookie = initiator_peer.cookie_jar.current().unwrap();
        retried.mac2 = crate::cookie::mac2(&cookie, Initiation::mac2_covered(&retried.to_bytes()));
        assert!(responder_device.handle_incoming_initiation(&retried, source).is_ok());
    }
}
