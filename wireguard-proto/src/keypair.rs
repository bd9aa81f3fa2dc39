/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Keypair lifecycle: current/previous/next rotation and per-keypair replay
 * filter, spec.md §3/§4.4. Grounded on ZSSP's `SessionKey`/`KEY_HISTORY_SIZE`
 * ring (zssp/src/zssp.rs) generalized from a 3-generation ratchet key ring
 * down to the single previous/current/next triplet spec.md calls for.
 */

use wireguard_crypto::secret::Secret;

use crate::constants::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME_MS};
use crate::noise::TransportKeys;
use crate::util::now_ms;

/// Sliding anti-replay window over the last 2048 received counters, per
/// spec.md §4.4's nonce-reuse protection for a single keypair.
pub struct ReplayFilter {
    // `highest` is the greatest counter accepted so far; `mask` tracks
    // which of the 2048 counters below it have already been seen as a
    // bitset, `mask` bit 0 corresponding to `highest`.
    highest: u64,
    window: [u64; WINDOW_WORDS],
}

const WINDOW_SIZE: usize = 2048;
const WINDOW_WORDS: usize = WINDOW_SIZE / 64;

impl Default for ReplayFilter {
    fn default() -> Self {
        Self { highest: 0, window: [0u64; WINDOW_WORDS] }
    }
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `counter` is new and should be accepted, marking it
    /// seen as a side effect. Returns false for replays, for counter 0 used
    /// twice, and for counters that fall below the window.
    pub fn check_and_mark(&mut self, counter: u64) -> bool {
        if counter == 0 && self.highest == 0 && !self.seen(0) {
            self.mark(0);
            return true;
        }
        if counter > self.highest {
            let shift = counter - self.highest;
            if shift as usize >= WINDOW_SIZE {
                self.window = [0u64; WINDOW_WORDS];
            } else {
                self.shift_window(shift as usize);
            }
            self.highest = counter;
            self.mark(0);
            return true;
        }
        let back = self.highest - counter;
        if back as usize >= WINDOW_SIZE {
            return false;
        }
        if self.seen(back as usize) {
            return false;
        }
        self.mark(back as usize);
        true
    }

    fn shift_window(&mut self, shift: usize) {
        if shift >= WINDOW_SIZE {
            self.window = [0u64; WINDOW_WORDS];
            return;
        }
        let word_shift = shift / 64;
        let bit_shift = shift % 64;
        let mut new_window = [0u64; WINDOW_WORDS];
        for i in (word_shift..WINDOW_WORDS).rev() {
            let src = i - word_shift;
            let mut v = self.window[src] << bit_shift;
            if bit_shift > 0 && src > 0 {
                v |= self.window[src - 1] >> (64 - bit_shift);
            }
            new_window[i] = v;
        }
        self.window = new_window;
    }

    fn seen(&self, back: usize) -> bool {
        let word = back / 64;
        let bit = back % 64;
        self.window[word] & (1u64 << bit) != 0
    }

    fn mark(&mut self, back: usize) {
        let word = back / 64;
        let bit = back % 64;
        self.window[word] |= 1u64 << bit;
    }
}

/// One generation of transport keys plus the bookkeeping needed to decide
/// when it must be rotated or rejected (spec.md §4.4/§4.7).
pub struct Keypair {
    pub local_index: u32,
    pub remote_index: u32,
    pub send_key: Secret<32>,
    pub recv_key: Secret<32>,
    pub is_initiator: bool,
    pub created_at_ms: i64,
    pub send_counter: std::sync::atomic::AtomicU64,
    pub replay: parking_lot::Mutex<ReplayFilter>,
}

impl Keypair {
    pub fn new(local_index: u32, remote_index: u32, keys: TransportKeys, is_initiator: bool) -> Self {
        Self {
            local_index,
            remote_index,
            send_key: keys.send,
            recv_key: keys.recv,
            is_initiator,
            created_at_ms: now_ms(),
            send_counter: std::sync::atomic::AtomicU64::new(0),
            replay: parking_lot::Mutex::new(ReplayFilter::new()),
        }
    }

    /// Atomically reserve the next send counter. Returns `None` once the
    /// hard message ceiling has been reached (spec.md §4.7
    /// `REJECT_AFTER_MESSAGES`).
    pub fn next_send_counter(&self) -> Option<u64> {
        let c = self.send_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if c >= REJECT_AFTER_MESSAGES {
            None
        } else {
            Some(c)
        }
    }

    /// Peek the next counter value that will be reserved, without
    /// reserving it. Used by the initiator-side rekey-by-count timer
    /// (spec.md §4.7 `REKEY_AFTER_MESSAGES`).
    pub fn current_send_counter(&self) -> u64 {
        self.send_counter.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.created_at_ms) >= REJECT_AFTER_TIME_MS
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at_ms)
    }
}

/// The previous/current/next triplet a peer holds so that packets still in
/// flight on an old keypair are not dropped the instant a new one is
/// negotiated (spec.md §3).
#[derive(Default)]
pub struct KeypairSlots {
    pub previous: Option<std::sync::Arc<Keypair>>,
    pub current: Option<std::sync::Arc<Keypair>>,
    pub next: Option<std::sync::Arc<Keypair>>,
}

impl KeypairSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly completed keypair. An initiator-side keypair is
    /// installed as `current` immediately, demoting the old `current` to
    /// `previous` and discarding any stale `next` (spec.md §4.4: "Initiator
    /// immediately installs the new keypair as current"). A responder-side
    /// keypair goes into `next` pending confirmation by the first authentic
    /// transport packet decrypted under it — unless this is the very first
    /// keypair the peer has ever had, in which case it becomes `current`
    /// directly since there is nothing yet to keep receiving on
    /// (spec.md §3: "next is populated only by a responder").
    pub fn insert_new(&mut self, kp: std::sync::Arc<Keypair>) {
        if kp.is_initiator {
            self.previous = self.current.take();
            self.current = Some(kp);
            self.next = None;
        } else if self.current.is_none() {
            self.current = Some(kp);
        } else {
            self.next = Some(kp);
        }
    }

    /// Promote `next` to `current` once the responder's first authenticated
    /// transport packet confirms it, retiring the old `current` to
    /// `previous` (spec.md §3).
    pub fn rotate_in_next(&mut self) {
        if let Some(next) = self.next.take() {
            self.previous = self.current.take();
            self.current = Some(next);
        }
    }

    pub fn by_local_index(&self, index: u32) -> Option<&std::sync::Arc<Keypair>> {
        [&self.previous, &self.current, &self.next]
            .into_iter()
            .flatten()
            .find(|kp| kp.local_index == index)
    }

    /// Discard every slot, e.g. because the local static identity changed
    /// and all existing sessions are no longer valid (spec.md §3).
    pub fn clear(&mut self) {
        self.previous = None;
        self.current = None;
        self.next = None;
    }

    pub fn drop_expired(&mut self, now: i64) {
        if self.previous.as_ref().is_some_and(|kp| kp.is_expired(now)) {
            self.previous = None;
        }
        if self.current.as_ref().is_some_and(|kp| kp.is_expired(now)) {
            self.current = None;
        }
        if self.next.as_ref().is_some_and(|kp| kp.is_expired(now)) {
            self.next = None;
        }
    }
}
