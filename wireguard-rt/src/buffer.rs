/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * A fixed-capacity packet buffer, ported near-verbatim in spirit from
 * `zerotier-network-hypervisor/src/util/buffer.rs`'s `Buffer<L>`: a plain
 * byte array plus a logical length, recyclable through [`crate::pool::Pool`]
 * instead of allocating fresh on every packet.
 *
 * Packets handed across the parallel encrypt/decrypt pipelines (spec.md
 * §4.5/§4.6) need headroom before their payload for the 16-byte transport
 * header the tunnel `read` contract reserves (spec.md §6); `HEADROOM` below
 * is that reservation.
 */

/// Headroom reserved at the front of every pooled packet buffer for the
/// transport message header (type/receiver/counter, spec.md §4.4), so the
/// AEAD seal can write ciphertext in place without a second allocation.
pub const HEADROOM: usize = 16;

/// Trailing room reserved for the AEAD tag.
pub const TAG_ROOM: usize = 16;

/// Maximum plaintext IP packet this engine will carry, matching common
/// tunnel MTUs with room to spare; oversized tunnel reads are truncated by
/// the `Tun` implementation, not by this buffer.
pub const MAX_PACKET: usize = 2048;

/// A recyclable fixed-capacity buffer: `HEADROOM` bytes of header space, up
/// to `MAX_PACKET` bytes of payload, `TAG_ROOM` bytes of trailer space.
pub struct PacketBuffer {
    data: [u8; HEADROOM + MAX_PACKET + TAG_ROOM],
    len: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self { data: [0u8; HEADROOM + MAX_PACKET + TAG_ROOM], len: 0 }
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The full backing storage, for callers (e.g. a `Tun`/`Udp` read) that
    /// need to write directly into the buffer before the logical length is
    /// known.
    #[inline(always)]
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_is_empty_and_sized_for_headroom() {
        let b = PacketBuffer::new();
        assert_eq!(b.len(), 0);
        assert!(b.capacity() >= HEADROOM + TAG_ROOM);
    }

    #[test]
    fn set_len_clamps_to_capacity() {
        let mut b = PacketBuffer::new();
        b.set_len(b.capacity() + 100);
        assert_eq!(b.len(), b.capacity());
    }
}
