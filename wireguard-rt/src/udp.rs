/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * The UDP bind capability boundary, spec.md §6. Grounded on
 * `vl1-service/src/sys/udp.rs`'s `BoundUdpPort`/`BoundUdpSocket` (bind
 * lifecycle, per-socket `Arc<tokio::net::UdpSocket>`, explicit rebind on
 * routing changes) but trimmed to the single-bind-per-port model spec.md §6
 * describes rather than that file's per-interface hard-bind handling
 * (platform-specific route-table listening is an explicit out-of-scope
 * external collaborator per spec.md §1).
 */

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// A remote address plus an optional hint about which local socket/address
/// a reply should be sent from. `clear_src()` lets the kernel re-choose a
/// route the next time conditions change, e.g. after the peer roams
/// (spec.md §6, "Endpoint").
#[derive(Clone, Debug)]
pub struct Endpoint {
    addr: SocketAddr,
    has_src_hint: bool,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, has_src_hint: false }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn clear_src(&mut self) {
        self.has_src_hint = false;
    }

    pub fn has_src_hint(&self) -> bool {
        self.has_src_hint
    }
}

/// One received batch: datagrams, their lengths, and the endpoint each
/// arrived from.
pub struct RecvBatch {
    pub buffers: Vec<Vec<u8>>,
    pub sizes: Vec<usize>,
    pub endpoints: Vec<Endpoint>,
}

/// The UDP socket collaborator: sends and receives the encrypted datagrams
/// that carry the WireGuard wire protocol (spec.md §6).
#[async_trait]
pub trait Udp: Send + Sync + 'static {
    async fn open(&self, preferred_port: u16) -> io::Result<u16>;

    async fn recv(&self, batch_size: usize) -> io::Result<RecvBatch>;

    async fn send(&self, endpoint: &Endpoint, data: &[u8]) -> io::Result<()>;

    fn set_mark(&self, mark: u32) -> io::Result<()>;

    fn batch_size(&self) -> usize;

    fn parse_endpoint(&self, text: &str) -> Option<Endpoint>;

    async fn close(&self) -> io::Result<()>;
}

/// A real, cross-platform `Udp` implementation backed by `tokio::net::UdpSocket`.
/// This is ordinary async networking, not kernel integration, so it is
/// implemented here rather than left as a pure trait boundary like [`crate::tun::Tun`].
pub struct TokioUdp {
    socket: tokio::sync::RwLock<Option<Arc<UdpSocket>>>,
    closed: AtomicBool,
    batch_size: usize,
}

impl TokioUdp {
    pub fn new(batch_size: usize) -> Self {
        Self { socket: tokio::sync::RwLock::new(None), closed: AtomicBool::new(false), batch_size }
    }

    async fn current(&self) -> io::Result<Arc<UdpSocket>> {
        self.socket
            .read()
            .await
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "udp socket not open"))
    }
}

#[async_trait]
impl Udp for TokioUdp {
    async fn open(&self, preferred_port: u16) -> io::Result<u16> {
        let socket = UdpSocket::bind(("0.0.0.0", preferred_port)).await?;
        let actual_port = socket.local_addr()?.port();
        *self.socket.write().await = Some(Arc::new(socket));
        self.closed.store(false, Ordering::Release);
        Ok(actual_port)
    }

    async fn recv(&self, batch_size: usize) -> io::Result<RecvBatch> {
        let socket = self.current().await?;
        let mut buffers = Vec::with_capacity(batch_size);
        let mut sizes = Vec::with_capacity(batch_size);
        let mut endpoints = Vec::with_capacity(batch_size);

        // tokio's UdpSocket has no built-in recvmmsg equivalent; a single
        // non-blocking datagram is read per batch slot, stopping early (but
        // never returning zero datagrams) once nothing more is immediately
        // ready.
        let mut buf = vec![0u8; 2048];
        let (n, from) = socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        sizes.push(n);
        endpoints.push(Endpoint::new(from));
        buffers.push(buf);

        for _ in 1..batch_size {
            let mut buf = vec![0u8; 2048];
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    buf.truncate(n);
                    sizes.push(n);
                    endpoints.push(Endpoint::new(from));
                    buffers.push(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(RecvBatch { buffers, sizes, endpoints })
    }

    async fn send(&self, endpoint: &Endpoint, data: &[u8]) -> io::Result<()> {
        let socket = self.current().await?;
        socket.send_to(data, endpoint.addr()).await?;
        Ok(())
    }

    fn set_mark(&self, _mark: u32) -> io::Result<()> {
        // SO_MARK is Linux-specific socket-option plumbing; left unimplemented
        // here since fwmark handling is part of the platform route-table
        // integration spec.md §1 calls out as an external collaborator.
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn parse_endpoint(&self, text: &str) -> Option<Endpoint> {
        text.parse::<SocketAddr>().ok().map(Endpoint::new)
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        *self.socket.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_datagram_between_two_binds() {
        let a = TokioUdp::new(16);
        let b = TokioUdp::new(16);
        let port_a = a.open(0).await.unwrap();
        let port_b = b.open(0).await.unwrap();

        let dest = Endpoint::new(format!("127.0.0.1:{port_b}").parse().unwrap());
        a.send(&dest, b"hello").await.unwrap();

        let batch = b.recv(16).await.unwrap();
        assert_eq!(batch.buffers.len(), 1);
        assert_eq!(&batch.buffers[0][..batch.sizes[0]], b"hello");
        assert_eq!(batch.endpoints[0].addr().port(), port_a);
    }

    #[test]
    fn parse_endpoint_rejects_garbage() {
        let u = TokioUdp::new(16);
        assert!(u.parse_endpoint("not-an-address").is_none());
        assert!(u.parse_endpoint("127.0.0.1:51820").is_some());
    }
}
