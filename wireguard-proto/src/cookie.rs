/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * MAC1/MAC2 verification, the under-load cookie challenge, and the
 * per-source-IP token-bucket rate limiter, spec.md §4.3. The under-load
 * latch and rate-limiter GC cadence reuse the `IntervalGate`/
 * `AtomicIntervalGate` pattern from util.rs.
 */

use std::net::IpAddr;

use dashmap::DashMap;
use rand_core::{OsRng, RngCore};
use wireguard_crypto::aead::{xopen, xseal};
use wireguard_crypto::hash::mac;

use crate::constants::{
    COOKIE_REFRESH_TIME_MS, RATE_LIMITER_BURST, RATE_LIMITER_ENTRY_LIFETIME_MS,
    RATE_LIMITER_PACKETS_PER_SECOND, UNDER_LOAD_AFTER_TIME_MS,
};
use crate::util::{now_ms, AtomicIntervalGate};

const LABEL_MAC1: &[u8] = b"mac1----";
const LABEL_COOKIE: &[u8] = b"cookie--";

/// Per-peer-pubkey MAC1 key and cookie-decryption key, derived once and
/// reused for the life of the peer (spec.md §4.3: `mac1_key = BLAKE2s("mac1----" || spk)`).
pub struct PeerMacKeys {
    pub mac1_key: [u8; 32],
    pub cookie_key: [u8; 32],
}

impl PeerMacKeys {
    pub fn derive(their_static_public: &[u8; 32]) -> Self {
        Self {
            mac1_key: wireguard_crypto::hash::hash(&[LABEL_MAC1, their_static_public]),
            cookie_key: wireguard_crypto::hash::hash(&[LABEL_COOKIE, their_static_public]),
        }
    }
}

/// Computes MAC1 over a message, and MAC2 once a valid cookie has been received.
pub fn mac1(mac1_key: &[u8; 32], covered: &[u8]) -> [u8; 16] {
    mac(mac1_key, &[covered])
}

pub fn mac2(cookie: &[u8; 16], covered: &[u8]) -> [u8; 16] {
    mac(cookie, &[covered])
}

/// Responder-side MAC1/MAC2 validation and cookie issuance. One instance per
/// local static identity; shared across all peers since the cookie secret is
/// keyed by our own identity, not the remote's.
pub struct CookieChecker {
    our_static_public: parking_lot::RwLock<[u8; 32]>,
    secret: parking_lot::RwLock<CookieSecret>,
    under_load: AtomicIntervalGate<UNDER_LOAD_AFTER_TIME_MS>,
}

struct CookieSecret {
    value: [u8; 32],
    created_at_ms: i64,
}

impl CookieChecker {
    pub fn new(our_static_public: [u8; 32]) -> Self {
        let mut value = [0u8; 32];
        OsRng.fill_bytes(&mut value);
        Self {
            our_static_public: parking_lot::RwLock::new(our_static_public),
            secret: parking_lot::RwLock::new(CookieSecret { value, created_at_ms: now_ms() }),
            under_load: AtomicIntervalGate::new(i64::MIN),
        }
    }

    /// Re-key after the local static identity changes (spec.md §3: changing
    /// the private key atomically invalidates all session keys).
    pub fn set_local_static_public(&self, our_static_public: [u8; 32]) {
        *self.our_static_public.write() = our_static_public;
    }

    fn cookie_key(&self) -> [u8; 32] {
        wireguard_crypto::hash::hash(&[LABEL_COOKIE, &*self.our_static_public.read()])
    }

    fn current_secret(&self) -> [u8; 32] {
        let now = now_ms();
        {
            let s = self.secret.read();
            if now.saturating_sub(s.created_at_ms) < COOKIE_REFRESH_TIME_MS {
                return s.value;
            }
        }
        let mut s = self.secret.write();
        if now.saturating_sub(s.created_at_ms) >= COOKIE_REFRESH_TIME_MS {
            let mut value = [0u8; 32];
            OsRng.fill_bytes(&mut value);
            s.value = value;
            s.created_at_ms = now;
        }
        s.value
    }

    /// Verify MAC1, which is mandatory on every initiation/response.
    pub fn verify_mac1(&self, mac1_key: &[u8; 32], covered: &[u8], claimed: &[u8; 16]) -> bool {
        use subtle::ConstantTimeEq;
        mac1(mac1_key, covered).ct_eq(claimed).into()
    }

    /// True once the responder has decided it is under load and should start
    /// demanding cookies before doing expensive DH work.
    pub fn mark_under_load_if_needed(&self, now: i64) -> bool {
        // `gate` both samples and latches; called once per accepted initiation
        // attempt by the handshake queue when it is near capacity.
        self.under_load.gate(now)
    }

    pub fn is_under_load(&self, now: i64) -> bool {
        now.saturating_sub(self.under_load.last()) < UNDER_LOAD_AFTER_TIME_MS
    }

    /// Compute the cookie value for a source address: BLAKE2s-MAC(secret, source-ip).
    fn cookie_for(&self, source: IpAddr) -> [u8; 16] {
        let secret = self.current_secret();
        let ip_bytes: Vec<u8> = match source {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        mac(&secret, &[&ip_bytes])
    }

    /// Build the encrypted cookie reply payload: XChaCha20-Poly1305 seal of the
    /// cookie under our cookie key, AAD = the peer's mac1 value, nonce random.
    pub fn seal_cookie_reply(&self, source: IpAddr, their_mac1: &[u8; 16]) -> ([u8; 24], [u8; 32]) {
        let cookie = self.cookie_for(source);
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let sealed = xseal(&self.cookie_key(), &nonce, their_mac1, &cookie);
        let mut out = [0u8; 32];
        out.copy_from_slice(&sealed);
        (nonce, out)
    }

    /// Verify MAC2 against the cookie we most recently issued for `source`.
    pub fn verify_mac2(&self, source: IpAddr, covered: &[u8], claimed: &[u8; 16]) -> bool {
        use subtle::ConstantTimeEq;
        let cookie = self.cookie_for(source);
        mac2(&cookie, covered).ct_eq(claimed).into()
    }
}

/// Initiator-side holder for a cookie received from a responder, plus the
/// logic to decrypt it and attach MAC2 to subsequent retries.
pub struct CookieJar {
    cookie_key: [u8; 32],
    held: parking_lot::Mutex<Option<([u8; 16], i64)>>,
}

impl CookieJar {
    pub fn new(their_static_public: &[u8; 32]) -> Self {
        Self {
            cookie_key: wireguard_crypto::hash::hash(&[LABEL_COOKIE, their_static_public]),
            held: parking_lot::Mutex::new(None),
        }
    }

    /// Decrypt and store a cookie reply. `our_mac1` is the MAC1 we sent on the
    /// initiation the reply is answering, used as AAD.
    pub fn receive(&self, nonce: &[u8; 24], encrypted_cookie: &[u8; 32], our_mac1: &[u8; 16]) -> bool {
        match xopen(&self.cookie_key, nonce, our_mac1, encrypted_cookie) {
            Some(plaintext) if plaintext.len() == 16 => {
                let mut cookie = [0u8; 16];
                cookie.copy_from_slice(&plaintext);
                *self.held.lock() = Some((cookie, now_ms()));
                true
            }
            _ => false,
        }
    }

    /// Cookies are only useful for `COOKIE_REFRESH_TIME_MS`; stale ones are
    /// dropped so an initiator does not keep sending a MAC2 that will fail
    /// against the responder's rotated secret.
    pub fn current(&self) -> Option<[u8; 16]> {
        let guard = self.held.lock();
        match *guard {
            Some((cookie, at)) if now_ms().saturating_sub(at) < COOKIE_REFRESH_TIME_MS => Some(cookie),
            _ => None,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
    last_seen_ms: i64,
}

/// Token-bucket rate limiter keyed by source IP, guarding the handshake
/// queue from spoofed-source floods before any expensive crypto runs.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    last_gc: AtomicIntervalGate<RATE_LIMITER_ENTRY_LIFETIME_MS>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: DashMap::new(), last_gc: AtomicIntervalGate::new(i64::MIN) }
    }

    /// Returns true if a packet from `source` is allowed through right now.
    pub fn allow(&self, source: IpAddr) -> bool {
        let now = now_ms();
        self.maybe_gc(now);
        let mut entry = self.buckets.entry(source).or_insert_with(|| Bucket {
            tokens: RATE_LIMITER_BURST as f64,
            last_refill_ms: now,
            last_seen_ms: now,
        });
        let elapsed_s = (now - entry.last_refill_ms).max(0) as f64 / 1000.0;
        entry.tokens = (entry.tokens + elapsed_s * RATE_LIMITER_PACKETS_PER_SECOND as f64)
            .min(RATE_LIMITER_BURST as f64);
        entry.last_refill_ms = now;
        entry.last_seen_ms = now;
        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn maybe_gc(&self, now: i64) {
        if !self.last_gc.gate(now) {
            return;
        }
        self.buckets.retain(|_, b| now.saturating_sub(b.last_seen_ms) < RATE_LIMITER_ENTRY_LIFETIME_MS);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac1_round_trips_and_detects_tamper() {
        let keys = PeerMacKeys::derive(&[9u8; 32]);
        let covered = b"initiation-bytes";
        let m = mac1(&keys.mac1_key, covered);
        assert!(mac1(&keys.mac1_key, covered) == m);
        let other = PeerMacKeys::derive(&[8u8; 32]);
        assert_ne!(mac1(&other.mac1_key, covered), m);
    }

    #[test]
    fn cookie_round_trips_through_seal_and_jar() {
        let checker = CookieChecker::new([1u8; 32]);
        let jar = CookieJar::new(&[1u8; 32]);
        let source: IpAddr = "203.0.113.9".parse().unwrap();
        let our_mac1 = [7u8; 16];
        let (nonce, encrypted) = checker.seal_cookie_reply(source, &our_mac1);
        assert!(jar.receive(&nonce, &encrypted, &our_mac1));
        let cookie = jar.current().unwrap();
        let covered = b"response-bytes";
        let tag = mac2(&cookie, covered);
        assert!(checker.verify_mac2(source, covered, &tag));
    }

    #[test]
    fn cookie_reply_rejects_wrong_aad() {
        let checker = CookieChecker::new([1u8; 32]);
        let jar = CookieJar::new(&[1u8; 32]);
        let source: IpAddr = "203.0.113.9".parse().unwrap();
        let (nonce, encrypted) = checker.seal_cookie_reply(source, &[7u8; 16]);
        assert!(!jar.receive(&nonce, &encrypted, &[8u8; 16]));
    }

    #[test]
    fn under_load_latches_then_expires() {
        let checker = CookieChecker::new([1u8; 32]);
        assert!(checker.mark_under_load_if_needed(1_000));
        assert!(checker.is_under_load(1_500));
        assert!(!checker.is_under_load(3_000));
    }

    #[test]
    fn rate_limiter_exhausts_burst_then_recovers() {
        let rl = RateLimiter::new();
        let addr: IpAddr = "198.51.100.7".parse().unwrap();
        for _ in 0..RATE_LIMITER_BURST {
            assert!(rl.allow(addr));
        }
        assert!(!rl.allow(addr));
    }
}
