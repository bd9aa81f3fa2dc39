/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Per-peer runtime state: endpoint, handshake bookkeeping, keypair slots,
 * timers. Grounded on `zerotier-network-hypervisor/src/vl1/peer.rs`'s field
 * layout -- separate locks for send-path vs. receive-path state, atomic
 * counters for traffic stats, and a single roaming endpoint rather than
 * that file's `Mutex<Vec<Arc<Path>>>` multi-path tracking (spec.md §3 only
 * asks for one active endpoint per peer).
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cookie::{CookieJar, PeerMacKeys};
use crate::keypair::{Keypair, KeypairSlots};
use crate::noise::InitiatorHandshake;
use crate::util::now_ms;
use wireguard_crypto::tai64n::Tai64N;

/// A peer's configuration plus live protocol state. `V` is the identifying
/// handle the Cryptokey Routing trie stores (typically `Arc<Peer>` itself,
/// but kept generic so tests can use cheaper stand-ins).
pub struct Peer {
    pub static_public: [u8; 32],
    preshared_key: RwLock<[u8; 32]>,
    pub mac_keys: PeerMacKeys,
    pub cookie_jar: CookieJar,

    endpoint: RwLock<Option<SocketAddr>>,
    pub persistent_keepalive_interval_ms: RwLock<Option<i64>>,

    pub keypairs: Mutex<KeypairSlots>,
    pub handshake: Mutex<Option<PendingHandshake>>,
    last_initiation_timestamp: RwLock<Tai64N>,

    last_handshake_completed_ms: AtomicI64,
    last_sent_packet_ms: AtomicI64,
    last_received_packet_ms: AtomicI64,
    last_initiation_sent_ms: AtomicI64,
    last_initiation_consumed_ms: AtomicI64,
    handshake_attempts: AtomicU64,

    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
}

/// An initiation this device sent to the peer and is awaiting a response
/// for, plus the local index it was sent under so the response's
/// `receiver_index` can be matched back to it.
pub struct PendingHandshake {
    pub local_index: u32,
    pub state: InitiatorHandshake,
    pub sent_at_ms: i64,
}

impl Peer {
    pub fn new(static_public: [u8; 32], preshared_key: [u8; 32]) -> Self {
        Self {
            static_public,
            preshared_key: RwLock::new(preshared_key),
            mac_keys: PeerMacKeys::derive(&static_public),
            cookie_jar: CookieJar::new(&static_public),
            endpoint: RwLock::new(None),
            persistent_keepalive_interval_ms: RwLock::new(None),
            keypairs: Mutex::new(KeypairSlots::new()),
            handshake: Mutex::new(None),
            last_initiation_timestamp: RwLock::new(Tai64N::default()),
            last_handshake_completed_ms: AtomicI64::new(i64::MIN),
            last_sent_packet_ms: AtomicI64::new(i64::MIN),
            last_received_packet_ms: AtomicI64::new(i64::MIN),
            last_initiation_sent_ms: AtomicI64::new(i64::MIN),
            last_initiation_consumed_ms: AtomicI64::new(i64::MIN),
            handshake_attempts: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
        }
    }

    pub fn preshared_key(&self) -> [u8; 32] {
        *self.preshared_key.read()
    }

    /// Update the preshared key via the config protocol's `set` operation
    /// (spec.md §4.8). Does not disturb any live session — only newly
    /// begun handshakes use the new value.
    pub fn set_preshared_key(&self, psk: [u8; 32]) {
        *self.preshared_key.write() = psk;
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    /// Update the roaming endpoint, e.g. after a successfully authenticated
    /// packet arrives from a new source address (spec.md §3, "roaming").
    pub fn set_endpoint(&self, addr: SocketAddr) {
        *self.endpoint.write() = Some(addr);
    }

    pub fn note_handshake_completed(&self, now: i64) {
        self.last_handshake_completed_ms.store(now, Ordering::Relaxed);
        self.handshake_attempts.store(0, Ordering::Relaxed);
    }

    pub fn note_packet_sent(&self, now: i64) {
        self.last_sent_packet_ms.store(now, Ordering::Relaxed);
    }

    pub fn note_packet_received(&self, now: i64) {
        self.last_received_packet_ms.store(now, Ordering::Relaxed);
    }

    pub fn note_initiation_sent(&self, now: i64) {
        self.last_initiation_sent_ms.store(now, Ordering::Relaxed);
        self.handshake_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Highest TAI64N timestamp accepted from this peer's initiations so
    /// far, used to reject replayed/out-of-order handshake attempts
    /// (spec.md §4.4 step 3).
    pub fn last_initiation_timestamp(&self) -> Tai64N {
        *self.last_initiation_timestamp.read()
    }

    pub fn set_last_initiation_timestamp(&self, ts: Tai64N) {
        *self.last_initiation_timestamp.write() = ts;
    }

    pub fn last_initiation_consumed_ms(&self) -> i64 {
        self.last_initiation_consumed_ms.load(Ordering::Relaxed)
    }

    pub fn note_initiation_consumed(&self, now: i64) {
        self.last_initiation_consumed_ms.store(now, Ordering::Relaxed);
    }

    pub fn last_handshake_completed_at(&self) -> i64 {
        self.last_handshake_completed_ms.load(Ordering::Relaxed)
    }

    pub fn last_sent_packet_at(&self) -> i64 {
        self.last_sent_packet_ms.load(Ordering::Relaxed)
    }

    pub fn last_received_packet_at(&self) -> i64 {
        self.last_received_packet_ms.load(Ordering::Relaxed)
    }

    pub fn last_initiation_sent_at(&self) -> i64 {
        self.last_initiation_sent_ms.load(Ordering::Relaxed)
    }

    pub fn handshake_attempts(&self) -> u64 {
        self.handshake_attempts.load(Ordering::Relaxed)
    }

    /// True once a keypair exists that has not yet hit its hard expiry.
    pub fn has_live_session(&self) -> bool {
        let now = now_ms();
        let slots = self.keypairs.lock();
        slots.current.as_ref().is_some_and(|kp| !kp.is_expired(now))
    }

    pub fn current_keypair(&self) -> Option<Arc<Keypair>> {
        self.keypairs.lock().current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_has_no_session_or_endpoint() {
        let p = Peer::new([1u8; 32], [0u8; 32]);
        assert!(p.endpoint().is_none());
        assert!(!p.has_live_session());
    }

    #[test]
    fn endpoint_roams_on_update() {
        let p = Peer::new([1u8; 32], [0u8; 32]);
        let a: SocketAddr = "10.0.0.1:51820".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:51820".parse().unwrap();
        p.set_endpoint(a);
        assert_eq!(p.endpoint(), Some(a));
        p.set_endpoint(b);
        assert_eq!(p.endpoint(), Some(b));
    }

    #[test]
    fn handshake_attempt_counter_resets_on_completion() {
        let p = Peer::new([1u8; 32], [0u8; 32]);
        p.note_initiation_sent(1000);
        p.note_initiation_sent(2000);
        assert_eq!(p.handshake_attempts(), 2);
        p.note_handshake_completed(3000);
        assert_eq!(p.handshake_attempts(), 0);
    }
}
