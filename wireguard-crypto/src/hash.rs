/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use blake2::digest::{FixedOutput, Update};
use blake2::Blake2s256;

use crate::secret::Secret;

pub const HASH_SIZE: usize = 32;

/// BLAKE2s's block size, used to pad/hash the key for the HMAC construction below.
const BLOCK_SIZE: usize = 64;

/// BLAKE2s(data...), used to mix arbitrary public values into the handshake hash `h`.
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut h = Blake2s256::default();
    for p in parts {
        Update::update(&mut h, p);
    }
    h.finalize_fixed().into()
}

/// HMAC-BLAKE2s(key, data...), Noise's `HMAC-HASH` building block for the KDF.
/// This is the literal RFC 2104 construction `H((K'^opad) || H((K'^ipad) || m))`
/// over plain (unkeyed) BLAKE2s, matching real WireGuard's `noise-helpers.go`
/// (`crypto/hmac` wrapping `blake2s.New256`) rather than BLAKE2s's own native
/// keyed-MAC mode, which derives different output for the same key/message.
fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        key_block[..HASH_SIZE].copy_from_slice(&hash(&[key]));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0u8; BLOCK_SIZE];
    let mut opad = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] = key_block[i] ^ 0x36;
        opad[i] = key_block[i] ^ 0x5c;
    }

    let mut inner = Blake2s256::default();
    Update::update(&mut inner, &ipad);
    for p in parts {
        Update::update(&mut inner, p);
    }
    let inner_hash: [u8; HASH_SIZE] = inner.finalize_fixed().into();

    let mut outer = Blake2s256::default();
    Update::update(&mut outer, &opad);
    Update::update(&mut outer, &inner_hash);
    outer.finalize_fixed().into()
}

/// Noise `KDF1(ck, input) -> t0`.
pub fn kdf1(chaining_key: &[u8; HASH_SIZE], input: &[u8]) -> Secret<HASH_SIZE> {
    let t0 = hmac(chaining_key, &[input]);
    let output = hmac(&t0, &[&[0x01]]);
    Secret(output)
}

/// Noise `KDF2(ck, input) -> (ck', k)`.
pub fn kdf2(chaining_key: &[u8; HASH_SIZE], input: &[u8]) -> (Secret<HASH_SIZE>, Secret<HASH_SIZE>) {
    let t0 = hmac(chaining_key, &[input]);
    let t1 = hmac(&t0, &[&[0x01]]);
    let t2 = hmac(&t0, &[&t1, &[0x02]]);
    (Secret(t1), Secret(t2))
}

/// Noise `KDF3(ck, input) -> (ck', tau, k)`, used for the IKpsk2 preshared-key mix-in.
pub fn kdf3(chaining_key: &[u8; HASH_SIZE], input: &[u8]) -> (Secret<HASH_SIZE>, Secret<HASH_SIZE>, Secret<HASH_SIZE>) {
    let t0 = hmac(chaining_key, &[input]);
    let t1 = hmac(&t0, &[&[0x01]]);
    let t2 = hmac(&t0, &[&t1, &[0x02]]);
    let t3 = hmac(&t0, &[&t2, &[0x03]]);
    (Secret(t1), Secret(t2), Secret(t3))
}

/// MAC1/MAC2 style 16-byte authenticator: BLAKE2s-MAC truncated to 16 bytes.
pub fn mac(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let full = hmac(key, parts);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}
