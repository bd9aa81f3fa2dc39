/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Small timer-gate helpers shared by the cookie/rate-limit and peer-timer
 * subsystems.
 */

use std::sync::atomic::{AtomicI64, Ordering};

/// Boolean rate limiter with non-atomic (single-writer) semantics.
#[repr(transparent)]
pub struct IntervalGate<const FREQ_MS: i64>(i64);

impl<const FREQ_MS: i64> Default for IntervalGate<FREQ_MS> {
    #[inline(always)]
    fn default() -> Self {
        Self(i64::MIN)
    }
}

impl<const FREQ_MS: i64> IntervalGate<FREQ_MS> {
    #[inline(always)]
    pub fn new(initial_ts: i64) -> Self {
        Self(initial_ts)
    }

    /// Returns true (and latches `time`) if at least `FREQ_MS` has elapsed since the last gate.
    #[inline(always)]
    pub fn gate(&mut self, time: i64) -> bool {
        if time.saturating_sub(self.0) >= FREQ_MS {
            self.0 = time;
            true
        } else {
            false
        }
    }

    #[inline(always)]
    pub fn last(&self) -> i64 {
        self.0
    }
}

/// Boolean rate limiter with atomic (multi-writer) semantics.
#[repr(transparent)]
pub struct AtomicIntervalGate<const FREQ_MS: i64>(AtomicI64);

impl<const FREQ_MS: i64> Default for AtomicIntervalGate<FREQ_MS> {
    #[inline(always)]
    fn default() -> Self {
        Self(AtomicI64::new(i64::MIN))
    }
}

impl<const FREQ_MS: i64> AtomicIntervalGate<FREQ_MS> {
    #[inline(always)]
    pub fn new(initial_ts: i64) -> Self {
        Self(AtomicI64::new(initial_ts))
    }

    #[inline(always)]
    pub fn gate(&self, time: i64) -> bool {
        let prev = self.0.load(Ordering::Acquire);
        if time.saturating_sub(prev) < FREQ_MS {
            false
        } else {
            self.0.store(time, Ordering::Release);
            true
        }
    }

    #[inline(always)]
    pub fn last(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Current monotonic time in milliseconds, used throughout the engine instead
/// of wall-clock time so that system clock jumps cannot affect handshake or
/// rekey timing.
#[inline(always)]
pub fn now_ms() -> i64 {
    use std::time::Instant;
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_latches() {
        let mut g: IntervalGate<1000> = IntervalGate::new(0);
        assert!(g.gate(1000));
        assert!(!g.gate(1500));
        assert!(g.gate(2000));
    }

    #[test]
    fn atomic_gate_latches() {
        let g: AtomicIntervalGate<1000> = AtomicIntervalGate::new(0);
        assert!(g.gate(1000));
        assert!(!g.gate(1999));
        assert!(g.gate(2000));
    }
}
