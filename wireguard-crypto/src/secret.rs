/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A fixed-size secret byte string that is zeroed on drop.
///
/// Used for chaining keys, DH shared secrets, and AEAD keys throughout the
/// handshake state machine so that no secret outlives its last use in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(pub [u8; N]);

impl<const N: usize> Secret<N> {
    #[inline(always)]
    pub fn zero() -> Self {
        Self([0u8; N])
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    #[inline(always)]
    pub fn first_n<const M: usize>(&self) -> [u8; M] {
        assert!(M <= N);
        let mut out = [0u8; M];
        out.copy_from_slice(&self.0[..M]);
        out
    }
}

impl<const N: usize> From<[u8; N]> for Secret<N> {
    #[inline(always)]
    fn from(b: [u8; N]) -> Self {
        Self(b)
    }
}

impl<const N: usize> Default for Secret<N> {
    #[inline(always)]
    fn default() -> Self {
        Self::zero()
    }
}
