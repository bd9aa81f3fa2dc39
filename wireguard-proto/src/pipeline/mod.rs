/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Parallel encrypt/decrypt pipelines, spec.md §4.5/§4.6. Grounded on
 * `vl1-service`'s per-core task-spawn pattern (`vl1service.rs`'s
 * `udp_bind_daemon`, one task per listener thread) combined with ZSSP's
 * per-packet encrypt/decrypt loop in `zssp/src/zssp.rs`'s `send`/
 * `receive_complete`. Packets for a given keypair may finish their AEAD
 * work out of order across worker tasks; the `OrderingGate` below is the
 * "ordering token" design notes §9 calls for, serializing delivery back
 * into counter order without serializing the crypto itself.
 */

pub mod inbound;
pub mod outbound;

use std::collections::BTreeSet;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A send-side or receive-side collaborator that moves bytes to/from the
/// network. `wireguard-rt` provides the real UDP-backed implementation;
/// tests use an in-memory stand-in.
pub trait PacketSink: Send + Sync + 'static {
    fn send_to(&self, dest: SocketAddr, data: &[u8]) -> std::io::Result<()>;
}

/// Lets concurrently-running encrypt/decrypt tasks finish in any order
/// while guaranteeing the side effect each is gated on (a socket write, a
/// delivery to the TUN device) happens in ascending counter order.
pub struct OrderingGate {
    next_due: Mutex<u64>,
    pending: Mutex<BTreeSet<u64>>,
    notify: Notify,
}

impl Default for OrderingGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingGate {
    pub fn new() -> Self {
        Self { next_due: Mutex::new(0), pending: Mutex::new(BTreeSet::new()), notify: Notify::new() }
    }

    /// Block until `ticket` is the next one due, i.e. every smaller ticket
    /// issued for this gate has already called [`Self::advance`].
    pub async fn wait_for(&self, ticket: u64) {
        loop {
            // Register with `Notify` *before* checking the condition: a
            // bare `.notified().await` after the check would leave a window
            // in which another thread's `advance()` -> `notify_waiters()`
            // runs between the check and the first poll of the `Notified`
            // future and is missed forever, since `notify_waiters()` only
            // wakes futures already polled at least once. `enable()` makes
            // this `Notified` count as already-registered so a
            // `notify_waiters()` anywhere after this line is never lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if ticket == *self.next_due.lock() {
                return;
            }

            self.pending.lock().insert(ticket);
            notified.await;
        }
    }

    /// Release the next ticket, waking any task waiting on it (or the one
    /// after it, if that task already queued up via `wait_for`).
    pub fn advance(&self) {
        let mut next = self.next_due.lock();
        *next += 1;
        drop(next);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn ordering_gate_releases_in_ticket_order() {
        let gate = Arc::new(OrderingGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for ticket in (0u64..5).rev() {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gate.wait_for(ticket).await;
                order.lock().push(ticket);
                gate.advance();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }
}
