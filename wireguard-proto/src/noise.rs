/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Noise_IKpsk2 handshake over Curve25519, spec.md §4.4. Reimplements the
 * session state machine ZSSP uses in
 * examples/Ausaci-ZeroTierOne-Official/zssp/src/zssp.rs (`Session::start_new`,
 * the `PACKET_TYPE_KEY_OFFER`/`PACKET_TYPE_KEY_COUNTER_OFFER` branches of
 * `receive_complete`, and its `begin_symmetric_session` key split) against
 * the exact byte layout and KDF chain spec.md §4.4 specifies, rather than
 * ZSSP's own P-384/Kyber hybrid ratchet.
 *
 * Throughout, the chaining key `ck` is carried as a plain `[u8; 32]` between
 * KDF steps (never as the zeroizing `Secret<32>` the KDF functions return)
 * so that it can be fed back into the next `kdf*` call without fighting the
 * borrow checker; only keys that are handed to the AEAD or returned to the
 * caller stay wrapped in `Secret`.
 */

use wireguard_crypto::aead::{open_in_place, seal_in_place};
use wireguard_crypto::dh::KeyPair;
use wireguard_crypto::hash::{hash, kdf1, kdf2, kdf3};
use wireguard_crypto::secret::Secret;
use wireguard_crypto::tai64n::Tai64N;

use crate::error::{ProtocolError, Result};
use crate::wire::{Initiation, Response};

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason A. Donenfeld";

fn initial_chaining_key_and_hash(responder_static_public: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let ck = hash(&[CONSTRUCTION]);
    let h = hash(&[&ck, IDENTIFIER]);
    let h = hash(&[&h, responder_static_public]);
    (ck, h)
}

/// Transport keys produced once a handshake completes, oriented from the
/// point of view of whichever side holds them.
pub struct TransportKeys {
    pub send: Secret<32>,
    pub recv: Secret<32>,
}

fn split(chaining_key: &[u8; 32]) -> (Secret<32>, Secret<32>) {
    kdf2(chaining_key, &[])
}

/// State carried by an initiator between sending an `Initiation` and
/// receiving the matching `Response`.
pub struct InitiatorHandshake {
    chaining_key: [u8; 32],
    hash: [u8; 32],
    ephemeral: KeyPair,
}

/// Build and seal an `Initiation` message. `psk` is the 32-byte preshared
/// key, all-zero if none is configured (spec.md §4.4 step 2's `Q`). Returns
/// `Err(DegenerateDh)` if the configured peer public key yields a degenerate
/// static-static shared secret, in which case the peer must not be
/// handshaked with at all (spec.md §4.4 step 4).
pub fn create_initiation(
    our_static: &KeyPair,
    their_static_public: &[u8; 32],
    _psk: &[u8; 32],
) -> Result<(Initiation, InitiatorHandshake)> {
    let (ck, h) = initial_chaining_key_and_hash(their_static_public);
    let ephemeral = KeyPair::generate();
    let ephemeral_public = ephemeral.public_bytes();

    let ck = kdf1(&ck, &ephemeral_public).first_n::<32>();
    let h = hash(&[&h, &ephemeral_public]);

    let es = ephemeral.agree(their_static_public).ok_or(ProtocolError::DegenerateDh)?;
    let (ck, k) = kdf2(&ck, es.as_bytes());
    let ck = ck.0;

    let our_static_public = our_static.public_bytes();
    let mut static_buf = [0u8; 32 + 16];
    static_buf[..32].copy_from_slice(&our_static_public);
    seal_in_place(k.as_bytes(), 0, &h, &mut static_buf, 32);
    let h = hash(&[&h, &static_buf]);

    let ss = our_static.agree(their_static_public).ok_or(ProtocolError::DegenerateDh)?;
    let (ck, k) = kdf2(&ck, ss.as_bytes());
    let ck = ck.0;

    let ts = Tai64N::now().to_bytes();
    let mut ts_buf = [0u8; 12 + 16];
    ts_buf[..12].copy_from_slice(&ts);
    seal_in_place(k.as_bytes(), 0, &h, &mut ts_buf, 12);
    let h = hash(&[&h, &ts_buf]);

    let msg = Initiation {
        sender_index: 0, // filled in by the caller once a local index is allocated
        unencrypted_ephemeral: ephemeral_public,
        encrypted_static: static_buf,
        encrypted_timestamp: ts_buf,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };

    Ok((msg, InitiatorHandshake { chaining_key: ck, hash: h, ephemeral }))
}

/// Result of successfully decrypting an initiation: the sender's claimed
/// static public key and handshake timestamp, plus responder-side state
/// needed to build the reply.
pub struct ConsumedInitiation {
    pub their_static_public: [u8; 32],
    pub timestamp: Tai64N,
    chaining_key: [u8; 32],
    hash: [u8; 32],
    their_ephemeral_public: [u8; 32],
}

pub fn consume_initiation(our_static: &KeyPair, msg: &Initiation) -> Result<ConsumedInitiation> {
    let our_static_public = our_static.public_bytes();
    let (ck, h) = initial_chaining_key_and_hash(&our_static_public);

    let ck = kdf1(&ck, &msg.unencrypted_ephemeral).first_n::<32>();
    let h = hash(&[&h, &msg.unencrypted_ephemeral]);

    let es = our_static.agree(&msg.unencrypted_ephemeral).ok_or(ProtocolError::DegenerateDh)?;
    let (ck, k) = kdf2(&ck, es.as_bytes());
    let ck = ck.0;

    let mut static_buf = msg.encrypted_static;
    let pt_len = open_in_place(k.as_bytes(), 0, &h, &mut static_buf).ok_or(ProtocolError::AuthenticationFailed)?;
    if pt_len != 32 {
        return Err(ProtocolError::Malformed);
    }
    let mut their_static_public = [0u8; 32];
    their_static_public.copy_from_slice(&static_buf[..32]);
    let h = hash(&[&h, &msg.encrypted_static]);

    let ss = our_static.agree(&their_static_public).ok_or(ProtocolError::DegenerateDh)?;
    let (ck, k) = kdf2(&ck, ss.as_bytes());
    let ck = ck.0;

    let mut ts_buf = msg.encrypted_timestamp;
    let pt_len = open_in_place(k.as_bytes(), 0, &h, &mut ts_buf).ok_or(ProtocolError::AuthenticationFailed)?;
    if pt_len != 12 {
        return Err(ProtocolError::Malformed);
    }
    let mut ts_bytes = [0u8; 12];
    ts_bytes.copy_from_slice(&ts_buf[..12]);
    let timestamp = Tai64N::from_bytes(&ts_bytes);
    let h = hash(&[&h, &msg.encrypted_timestamp]);

    Ok(ConsumedInitiation {
        their_static_public,
        timestamp,
        chaining_key: ck,
        hash: h,
        their_ephemeral_public: msg.unencrypted_ephemeral,
    })
}

/// Build and seal a `Response` message, completing the responder's side of
/// the handshake and producing transport keys oriented send/recv from the
/// responder's perspective.
pub fn create_response(consumed: &ConsumedInitiation, psk: &[u8; 32]) -> Result<(Response, TransportKeys)> {
    let ephemeral = KeyPair::generate();
    let ephemeral_public = ephemeral.public_bytes();
    let ck = kdf1(&consumed.chaining_key, &ephemeral_public).first_n::<32>();
    let h = hash(&[&consumed.hash, &ephemeral_public]);

    let ee = ephemeral.agree(&consumed.their_ephemeral_public).ok_or(ProtocolError::DegenerateDh)?;
    let ck = kdf1(&ck, ee.as_bytes()).first_n::<32>();

    let se = ephemeral.agree(&consumed.their_static_public).ok_or(ProtocolError::DegenerateDh)?;
    let ck = kdf1(&ck, se.as_bytes()).first_n::<32>();

    let (ck, tau, k) = kdf3(&ck, psk);
    let h = hash(&[&h, tau.as_bytes()]);

    let mut empty_buf = [0u8; 16];
    seal_in_place(k.as_bytes(), 0, &h, &mut empty_buf, 0);

    let (recv, send) = split(&ck.0);

    let msg = Response {
        sender_index: 0,
        receiver_index: 0,
        unencrypted_ephemeral: ephemeral_public,
        encrypted_nothing: empty_buf,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };

    Ok((msg, TransportKeys { send, recv }))
}

/// Consume a `Response`, completing the initiator's side and producing
/// transport keys oriented from the initiator's perspective (swapped
/// relative to the responder's).
pub fn consume_response(
    state: InitiatorHandshake,
    our_static: &KeyPair,
    msg: &Response,
    psk: &[u8; 32],
) -> Result<TransportKeys> {
    let ck = kdf1(&state.chaining_key, &msg.unencrypted_ephemeral).first_n::<32>();
    let h = hash(&[&state.hash, &msg.unencrypted_ephemeral]);

    let ee = state.ephemeral.agree(&msg.unencrypted_ephemeral).ok_or(ProtocolError::DegenerateDh)?;
    let ck = kdf1(&ck, ee.as_bytes()).first_n::<32>();

    let se = our_static.agree(&msg.unencrypted_ephemeral).ok_or(ProtocolError::DegenerateDh)?;
    let ck = kdf1(&ck, se.as_bytes()).first_n::<32>();

    let (ck, tau, k) = kdf3(&ck, psk);
    let h = hash(&[&h, tau.as_bytes()]);

    let mut empty_buf = msg.encrypted_nothing;
    let pt_len = open_in_place(k.as_bytes(), 0, &h, &mut empty_buf).ok_or(ProtocolError::AuthenticationFailed)?;
    if pt_len != 0 {
        return Err(ProtocolError::Malformed);
    }

    let (send, recv) = split(&ck.0);
    Ok(TransportKeys { send, recv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_derives_matching_transport_keys() {
        let initiator_static = KeyPair::generate();
        let responder_static = KeyPair::generate();
        let psk = [0u8; 32];

        let (mut init_msg, init_state) =
            create_initiation(&initiator_static, &responder_static.public_bytes(), &psk).unwrap();
        init_msg.sender_index = 1;

        let consumed = consume_initiation(&responder_static, &init_msg).unwrap();
        assert_eq!(consumed.their_static_public, initiator_static.public_bytes());

        let (mut resp_msg, responder_keys) = create_response(&consumed, &psk).unwrap();
        resp_msg.sender_index = 2;
        resp_msg.receiver_index = init_msg.sender_index;

        let initiator_keys = consume_response(init_state, &initiator_static, &resp_msg, &psk).unwrap();

        assert_eq!(initiator_keys.send.as_bytes(), responder_keys.recv.as_bytes());
        assert_eq!(initiator_keys.recv.as_bytes(), responder_keys.send.as_bytes());
    }

    #[test]
    fn tampered_static_ciphertext_is_rejected() {
        let initiator_static = KeyPair::generate();
        let responder_static = KeyPair::generate();
        let psk = [0u8; 32];
        let (mut init_msg, _state) =
            create_initiation(&initiator_static, &responder_static.public_bytes(), &psk).unwrap();
        init_msg.encrypted_static[0] ^= 0xff;
        assert!(consume_initiation(&responder_static, &init_msg).is_err());
    }

    #[test]
    fn mismatched_psk_fails_response_consumption() {
        let initiator_static = KeyPair::generate();
        let responder_static = KeyPair::generate();
        let (mut init_msg, init_state) =
            create_initiation(&initiator_static, &responder_static.public_bytes(), &[0u8; 32]).unwrap();
        init_msg.sender_index = 1;
        let consumed = consume_initiation(&responder_static, &init_msg).unwrap();
        let (resp_msg, _keys) = create_response(&consumed, &[1u8; 32]).unwrap();
        let result = consume_response(init_state, &initiator_static, &resp_msg, &[0u8; 32]);
        assert!(result.is_err());
    }
}
