/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use rand_core::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::secret::Secret;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const PRIVATE_KEY_SIZE: usize = 32;

/// A Curve25519 key pair used for both the static identity and per-handshake ephemerals.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    #[inline(always)]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[inline(always)]
    pub fn from_bytes(private: &[u8; PRIVATE_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(*private);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[inline(always)]
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    #[inline(always)]
    pub fn private_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Compute the Diffie-Hellman shared secret. Returns `None` if the result is the
    /// all-zero point, which Curve25519 can legitimately produce for adversarial inputs
    /// and which the Noise spec requires rejecting (spec.md §4.4 step 4).
    #[inline(always)]
    pub fn agree(&self, their_public: &[u8; PUBLIC_KEY_SIZE]) -> Option<Secret<32>> {
        let ss = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        let bytes = ss.to_bytes();
        if bool::from(bytes.ct_eq(&[0u8; 32])) {
            None
        } else {
            Some(Secret(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.agree(&b.public_bytes()).unwrap();
        let ba = b.agree(&a.public_bytes()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn zero_public_key_is_rejected() {
        let a = KeyPair::generate();
        assert!(a.agree(&[0u8; 32]).is_none());
    }
}
