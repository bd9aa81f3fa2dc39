/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * On-wire message layouts, spec.md §4.4. All integers are little-endian.
 */

pub const MESSAGE_TYPE_INITIATION: u32 = 1;
pub const MESSAGE_TYPE_RESPONSE: u32 = 2;
pub const MESSAGE_TYPE_COOKIE_REPLY: u32 = 3;
pub const MESSAGE_TYPE_TRANSPORT: u32 = 4;

pub const INITIATION_LEN: usize = 148;
pub const RESPONSE_LEN: usize = 92;
pub const COOKIE_REPLY_LEN: usize = 64;
pub const TRANSPORT_HEADER_LEN: usize = 16;

/// Read the 4-byte little-endian message type from the start of a datagram.
#[inline(always)]
pub fn peek_message_type(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        None
    } else {
        Some(u32::from_le_bytes(data[..4].try_into().unwrap()))
    }
}

/// Handshake initiation message, 148 bytes on the wire:
/// type(4) | sender(4) | ephemeral(32) | encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
pub struct Initiation {
    pub sender_index: u32,
    pub unencrypted_ephemeral: [u8; 32],
    pub encrypted_static: [u8; 32 + 16],
    pub encrypted_timestamp: [u8; 12 + 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl Initiation {
    pub fn to_bytes(&self) -> [u8; INITIATION_LEN] {
        let mut out = [0u8; INITIATION_LEN];
        out[0..4].copy_from_slice(&MESSAGE_TYPE_INITIATION.to_le_bytes());
        out[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        out[8..40].copy_from_slice(&self.unencrypted_ephemeral);
        out[40..88].copy_from_slice(&self.encrypted_static);
        out[88..116].copy_from_slice(&self.encrypted_timestamp);
        out[116..132].copy_from_slice(&self.mac1);
        out[132..148].copy_from_slice(&self.mac2);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != INITIATION_LEN || peek_message_type(data) != Some(MESSAGE_TYPE_INITIATION) {
            return None;
        }
        Some(Self {
            sender_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            unencrypted_ephemeral: data[8..40].try_into().unwrap(),
            encrypted_static: data[40..88].try_into().unwrap(),
            encrypted_timestamp: data[88..116].try_into().unwrap(),
            mac1: data[116..132].try_into().unwrap(),
            mac2: data[132..148].try_into().unwrap(),
        })
    }

    /// Bytes covered by MAC1 (everything before the two MAC fields).
    pub fn mac1_covered(data: &[u8]) -> &[u8] {
        &data[..116]
    }

    /// Bytes covered by MAC2 (everything before MAC2, including MAC1).
    pub fn mac2_covered(data: &[u8]) -> &[u8] {
        &data[..132]
    }
}

/// Handshake response message, 92 bytes on the wire:
/// type(4) | sender(4) | receiver(4) | ephemeral(32) | empty_encrypted(16) | mac1(16) | mac2(16)
pub struct Response {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub unencrypted_ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl Response {
    pub fn to_bytes(&self) -> [u8; RESPONSE_LEN] {
        let mut out = [0u8; RESPONSE_LEN];
        out[0..4].copy_from_slice(&MESSAGE_TYPE_RESPONSE.to_le_bytes());
        out[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        out[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        out[12..44].copy_from_slice(&self.unencrypted_ephemeral);
        out[44..60].copy_from_slice(&self.encrypted_nothing);
        out[60..76].copy_from_slice(&self.mac1);
        out[76..92].copy_from_slice(&self.mac2);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != RESPONSE_LEN || peek_message_type(data) != Some(MESSAGE_TYPE_RESPONSE) {
            return None;
        }
        Some(Self {
            sender_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            receiver_index: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            unencrypted_ephemeral: data[12..44].try_into().unwrap(),
            encrypted_nothing: data[44..60].try_into().unwrap(),
            mac1: data[60..76].try_into().unwrap(),
            mac2: data[76..92].try_into().unwrap(),
        })
    }

    pub fn mac1_covered(data: &[u8]) -> &[u8] {
        &data[..60]
    }

    pub fn mac2_covered(data: &[u8]) -> &[u8] {
        &data[..76]
    }
}

/// Cookie reply message, 64 bytes on the wire:
/// type(4) | receiver(4) | nonce(24) | encrypted_cookie(32)
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 16 + 16],
}

impl CookieReply {
    pub fn to_bytes(&self) -> [u8; COOKIE_REPLY_LEN] {
        let mut out = [0u8; COOKIE_REPLY_LEN];
        out[0..4].copy_from_slice(&MESSAGE_TYPE_COOKIE_REPLY.to_le_bytes());
        out[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        out[8..32].copy_from_slice(&self.nonce);
        out[32..64].copy_from_slice(&self.encrypted_cookie);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != COOKIE_REPLY_LEN || peek_message_type(data) != Some(MESSAGE_TYPE_COOKIE_REPLY) {
            return None;
        }
        Some(Self {
            receiver_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            nonce: data[8..32].try_into().unwrap(),
            encrypted_cookie: data[32..64].try_into().unwrap(),
        })
    }
}

/// Transport data header: type(4) | receiver(4) | counter(8), followed by
/// ciphertext + 16-byte tag (spec.md §4.4).
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MESSAGE_TYPE_TRANSPORT.to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
    }

    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < TRANSPORT_HEADER_LEN || peek_message_type(data) != Some(MESSAGE_TYPE_TRANSPORT) {
            return None;
        }
        Some(Self {
            receiver_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            counter: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }
}

/// Round `len` up to the next multiple of `PADDING_MULTIPLE`, capped at `mtu`.
pub fn padded_len(len: usize, mtu: usize) -> usize {
    use crate::constants::PADDING_MULTIPLE;
    let padded = len.div_ceil(PADDING_MULTIPLE) * PADDING_MULTIPLE;
    padded.min(mtu.max(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_round_trips() {
        let msg = Initiation {
            sender_index: 0xdead_beef,
            unencrypted_ephemeral: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), INITIATION_LEN);
        let parsed = Initiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, msg.sender_index);
        assert_eq!(parsed.unencrypted_ephemeral, msg.unencrypted_ephemeral);
    }

    #[test]
    fn padded_len_rounds_up() {
        assert_eq!(padded_len(1, 1420), 16);
        assert_eq!(padded_len(16, 1420), 16);
        assert_eq!(padded_len(17, 1420), 32);
    }
}
