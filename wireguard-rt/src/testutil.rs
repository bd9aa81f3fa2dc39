/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * In-memory `Tun`/`Udp` test doubles. No teacher analogue carries this
 * exact shape (ZeroTier's test harnesses talk to real sockets); these are
 * built fresh from the `Tun`/`Udp` trait contracts in tun.rs/udp.rs so the
 * engine's handshake and data-path wiring can be exercised without a real
 * kernel tunnel device or network socket.
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

type Mailbox = std::collections::VecDeque<(SocketAddr, Vec<u8>)>;

use crate::tun::{Tun, TunEvent};
use crate::udp::{Endpoint, RecvBatch, Udp};

/// An in-memory tunnel device: frames pushed in with [`LoopbackTun::inject`]
/// are returned by `read`; frames handed to `write` are captured for
/// assertions.
pub struct LoopbackTun {
    mtu: i32,
    inbox: Mutex<std::collections::VecDeque<Vec<u8>>>,
    outbox: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
    events_taken: AtomicUsize,
}

impl LoopbackTun {
    pub fn new(mtu: i32) -> Self {
        Self {
            mtu,
            inbox: Mutex::new(std::collections::VecDeque::new()),
            outbox: Mutex::new(Vec::new()),
            notify: Notify::new(),
            events_taken: AtomicUsize::new(0),
        }
    }

    /// Queue a plaintext IP frame as if the host kernel had handed it to
    /// this device for encryption and transmission.
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbox.lock().push_back(frame);
        self.notify.notify_one();
    }

    /// Frames the engine has delivered to this device after decryption.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.outbox.lock().clone()
    }
}

#[async_trait]
impl Tun for LoopbackTun {
    fn mtu(&self) -> i32 {
        self.mtu
    }

    fn batch_size(&self) -> usize {
        16
    }

    async fn read(&self, buffers: &mut [Vec<u8>], sizes: &mut [usize], offset: usize) -> std::io::Result<usize> {
        loop {
            {
                let mut inbox = self.inbox.lock();
                if !inbox.is_empty() {
                    let mut n = 0;
                    while n < buffers.len() {
                        let Some(frame) = inbox.pop_front() else { break };
                        let needed = offset + frame.len();
                        if buffers[n].len() < needed {
                            buffers[n].resize(needed, 0);
                        }
                        buffers[n][offset..needed].copy_from_slice(&frame);
                        sizes[n] = frame.len();
                        n += 1;
                    }
                    return Ok(n);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn write(&self, buffers: &[Vec<u8>], offset: usize) -> std::io::Result<usize> {
        let mut outbox = self.outbox.lock();
        for buf in buffers {
            outbox.push(buf[offset..].to_vec());
        }
        Ok(buffers.len())
    }

    fn close(&self) {}

    fn events(&self) -> Option<mpsc::Receiver<TunEvent>> {
        if self.events_taken.fetch_add(1, Ordering::SeqCst) == 0 {
            let (_tx, rx) = mpsc::channel(1);
            Some(rx)
        } else {
            None
        }
    }
}

/// An in-memory UDP socket. A shared [`LoopbackNetwork`] routes datagrams
/// between every [`LoopbackUdp`] bound to it by address, so handshake and
/// transport round trips can be tested without binding real sockets.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<LoopbackNetworkInner>>,
}

#[derive(Default)]
struct LoopbackNetworkInner {
    next_port: u16,
    mailboxes: HashMap<SocketAddr, Mailbox>,
    notifies: HashMap<SocketAddr, Arc<Notify>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopbackNetworkInner {
                next_port: 40000,
                mailboxes: HashMap::new(),
                notifies: HashMap::new(),
            })),
        }
    }

    fn bind(&self) -> (SocketAddr, Arc<Notify>) {
        let mut inner = self.inner.lock();
        let port = inner.next_port;
        inner.next_port += 1;
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        inner.mailboxes.insert(addr, Mailbox::new());
        let notify = Arc::new(Notify::new());
        inner.notifies.insert(addr, notify.clone());
        (addr, notify)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        if let Some(mailbox) = inner.mailboxes.get_mut(&to) {
            mailbox.push_back((from, data));
        }
        if let Some(notify) = inner.notifies.get(&to) {
            notify.notify_one();
        }
    }

    fn poll(&self, addr: SocketAddr) -> Option<(SocketAddr, Vec<u8>)> {
        self.inner.lock().mailboxes.get_mut(&addr).and_then(|m| m.pop_front())
    }
}

pub struct LoopbackUdp {
    network: LoopbackNetwork,
    addr: Mutex<Option<SocketAddr>>,
    notify: Mutex<Option<Arc<Notify>>>,
}

impl LoopbackUdp {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self { network, addr: Mutex::new(None), notify: Mutex::new(None) }
    }

    /// The port `open` bound, once it has run. Lets tests wire two
    /// loopback sockets to each other's addresses without a real bind.
    pub fn bound_port(&self) -> Option<u16> {
        self.addr.lock().map(|a| a.port())
    }
}

#[async_trait]
impl Udp for LoopbackUdp {
    async fn open(&self, _preferred_port: u16) -> std::io::Result<u16> {
        let (addr, notify) = self.network.bind();
        *self.addr.lock() = Some(addr);
        *self.notify.lock() = Some(notify);
        Ok(addr.port())
    }

    async fn recv(&self, batch_size: usize) -> std::io::Result<RecvBatch> {
        let addr = self.addr.lock().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "loopback udp not open")
        })?;
        let notify = self.notify.lock().clone().expect("addr set implies notify set");
        loop {
            let mut buffers = Vec::new();
            let mut sizes = Vec::new();
            let mut endpoints = Vec::new();
            while buffers.len() < batch_size {
                match self.network.poll(addr) {
                    Some((from, data)) => {
                        sizes.push(data.len());
                        endpoints.push(Endpoint::new(from));
                        buffers.push(data);
                    }
                    None => break,
                }
            }
            if !buffers.is_empty() {
                return Ok(RecvBatch { buffers, sizes, endpoints });
            }
            notify.notified().await;
        }
    }

    async fn send(&self, endpoint: &Endpoint, data: &[u8]) -> std::io::Result<()> {
        let addr = self.addr.lock().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "loopback udp not open")
        })?;
        self.network.deliver(addr, endpoint.addr(), data.to_vec());
        Ok(())
    }

    fn set_mark(&self, _mark: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn batch_size(&self) -> usize {
        16
    }

    fn parse_endpoint(&self, text: &str) -> Option<Endpoint> {
        text.parse::<SocketAddr>().ok().map(Endpoint::new)
    }

    async fn close(&self) -> std::io::Result<()> {
        *self.addr.lock() = None;
        Ok(())
    }
}
