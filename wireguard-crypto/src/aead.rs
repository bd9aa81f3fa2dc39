/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, XChaCha20Poly1305};

pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

/// Build the 12-byte transport/handshake nonce: 4 zero bytes followed by the
/// little-endian 8-byte counter, per spec.md §4.4/§6.
#[inline(always)]
pub fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_le_bytes());
    n
}

/// Seal `plaintext` in place using ChaCha20-Poly1305, appending the 16-byte tag.
/// `buf` must have `plaintext.len()` bytes of plaintext already written followed
/// by `TAG_SIZE` bytes of spare room.
pub fn seal_in_place(key: &[u8; KEY_SIZE], counter: u64, aad: &[u8], buf: &mut [u8], plaintext_len: usize) {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
    let nonce = nonce_from_counter(counter);
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, &mut buf[..plaintext_len])
        .expect("chacha20poly1305 seal cannot fail for valid sizes");
    buf[plaintext_len..plaintext_len + TAG_SIZE].copy_from_slice(&tag);
}

/// Seal a standalone plaintext into a freshly allocated `Vec<u8>` (plaintext || tag).
pub fn seal(key: &[u8; KEY_SIZE], counter: u64, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
    let nonce = nonce_from_counter(counter);
    cipher
        .encrypt(GenericArray::from_slice(&nonce), Payload { msg: plaintext, aad })
        .expect("chacha20poly1305 seal cannot fail for valid sizes")
}

/// Open `ciphertext_and_tag` in place, returning the plaintext length on success.
/// Returns `None` on authentication failure; the caller must treat this as a
/// silent protocol violation per spec.md §7, never as a panic.
pub fn open_in_place(key: &[u8; KEY_SIZE], counter: u64, aad: &[u8], buf: &mut [u8]) -> Option<usize> {
    if buf.len() < TAG_SIZE {
        return None;
    }
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
    let nonce = nonce_from_counter(counter);
    let pt_len = buf.len() - TAG_SIZE;
    let tag = GenericArray::clone_from_slice(&buf[pt_len..]);
    cipher
        .decrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, &mut buf[..pt_len], &tag)
        .ok()
        .map(|_| pt_len)
}

pub fn open(key: &[u8; KEY_SIZE], counter: u64, aad: &[u8], ciphertext_and_tag: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
    let nonce = nonce_from_counter(counter);
    cipher
        .decrypt(GenericArray::from_slice(&nonce), Payload { msg: ciphertext_and_tag, aad })
        .ok()
}

/// XChaCha20-Poly1305 seal used for the 24-byte-nonce cookie reply (spec.md §4.3).
pub fn xseal(key: &[u8; KEY_SIZE], nonce: &[u8; 24], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(nonce), Payload { msg: plaintext, aad })
        .expect("xchacha20poly1305 seal cannot fail for valid sizes")
}

pub fn xopen(key: &[u8; KEY_SIZE], nonce: &[u8; 24], aad: &[u8], ciphertext_and_tag: &[u8]) -> Option<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: ciphertext_and_tag, aad })
        .ok()
}
