/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::time::{SystemTime, UNIX_EPOCH};

/// Size in bytes of an encoded TAI64N timestamp (spec.md §4.4: 28 bytes when
/// sealed, 12 bytes raw wire TAI64N which the AEAD tag pads out to 28).
pub const TAI64N_SIZE: usize = 12;

const TAI64_EPOCH_OFFSET: u64 = 1 << 62;

/// A TAI64N timestamp: seconds since the TAI epoch (offset so it never goes
/// negative) plus nanoseconds within the second.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct Tai64N {
    seconds: u64,
    nanos: u32,
}

impl Tai64N {
    #[inline(always)]
    pub fn now() -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { seconds: TAI64_EPOCH_OFFSET + now.as_secs(), nanos: now.subsec_nanos() }
    }

    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; TAI64N_SIZE] {
        let mut out = [0u8; TAI64N_SIZE];
        out[..8].copy_from_slice(&self.seconds.to_be_bytes());
        out[8..].copy_from_slice(&self.nanos.to_be_bytes());
        out
    }

    #[inline(always)]
    pub fn from_bytes(b: &[u8; TAI64N_SIZE]) -> Self {
        let seconds = u64::from_be_bytes(b[..8].try_into().unwrap());
        let nanos = u32::from_be_bytes(b[8..].try_into().unwrap());
        Self { seconds, nanos }
    }
}

impl Default for Tai64N {
    fn default() -> Self {
        // The zero value sorts before any real timestamp, so a peer's
        // "last accepted timestamp" starts out trivially satisfied by any
        // genuine handshake (spec.md §4.4 step 3, replay protection).
        Self { seconds: 0, nanos: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let t = Tai64N::now();
        let b = t.to_bytes();
        assert_eq!(t, Tai64N::from_bytes(&b));
    }

    #[test]
    fn monotonic_ordering_holds() {
        let a = Tai64N { seconds: 10, nanos: 5 };
        let b = Tai64N { seconds: 10, nanos: 6 };
        let c = Tai64N { seconds: 11, nanos: 0 };
        assert!(a < b);
        assert!(b < c);
    }
}
