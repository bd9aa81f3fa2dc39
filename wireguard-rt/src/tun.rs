/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * The tunnel device capability boundary, spec.md §6. Grounded on
 * `zerotier-network-hypervisor`'s `HostSystem` trait (vl1/node.rs): the
 * protocol core is generic over this trait rather than linking any
 * particular platform's tun/tap code, matching design notes §9's guidance
 * to express external collaborators as capability sets swapped in at
 * construction time.
 *
 * A real platform `Tun` (opening `/dev/net/tun`, wiring up `ioctl`s, etc.)
 * is kernel integration and out of scope per spec.md §1's Non-goals; only
 * the trait and the in-memory test double in [`crate::testutil`] live here.
 */

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A change in the tunnel device's state, delivered out-of-band from the
/// read/write data path (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunEvent {
    MtuChanged(i32),
    Up,
    Down,
}

/// The tunnel device collaborator: exchanges plaintext IP frames with the
/// host operating system. Implementations must leave `offset` bytes of
/// headroom in each buffer passed to `read` so the caller can write the
/// transport header in place before encryption (spec.md §6).
#[async_trait]
pub trait Tun: Send + Sync + 'static {
    fn mtu(&self) -> i32;

    fn batch_size(&self) -> usize;

    /// Read up to `buffers.len()` plaintext IP frames, writing each at
    /// `offset` within its buffer and recording the frame length (not
    /// including `offset`) in the matching slot of `sizes`. Returns the
    /// number of frames read.
    async fn read(&self, buffers: &mut [Vec<u8>], sizes: &mut [usize], offset: usize) -> std::io::Result<usize>;

    /// Write up to `buffers.len()` plaintext IP frames, each starting at
    /// `offset` within its buffer and extending to the buffer's logical
    /// length. Returns the number of frames written.
    async fn write(&self, buffers: &[Vec<u8>], offset: usize) -> std::io::Result<usize>;

    fn close(&self);

    /// Take the device's event receiver. Implementations only support one
    /// live subscriber; a second call returns `None`.
    fn events(&self) -> Option<mpsc::Receiver<TunEvent>>;
}
