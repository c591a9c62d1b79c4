//! Pending proxy tickets
//!
//! When a public listener needs service, the session parks a one-shot
//! rendezvous slot here and asks the client to dial back. Dial-backs carry
//! no ticket on the wire, so slots are claimed oldest-first. Tickets are
//! session-local, monotonically assigned, and claimed at most once; a slot
//! whose listener has given up is skipped and dropped.

use outpost_router::ProxyRequest;
use outpost_transport::ProxyStream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::trace;

/// One parked rendezvous
pub struct ProxySlot {
    pub ticket: u64,
    pub url: String,
    pub client_addr: String,
    pub reply: oneshot::Sender<ProxyStream>,
    created: Instant,
}

/// FIFO pool of unclaimed tickets for one session
pub struct PendingProxies {
    slots: Mutex<VecDeque<ProxySlot>>,
    next_ticket: AtomicU64,
}

impl PendingProxies {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Park a listener's request and return its ticket
    pub fn park(&self, request: ProxyRequest) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let slot = ProxySlot {
            ticket,
            url: request.url,
            client_addr: request.client_addr,
            reply: request.reply,
            created: Instant::now(),
        };
        trace!(ticket, "parked proxy ticket");
        self.slots.lock().unwrap().push_back(slot);
        ticket
    }

    /// Claim the oldest live ticket. Slots whose listener already dropped
    /// its receiver are discarded on the way.
    pub fn claim(&self) -> Option<ProxySlot> {
        let mut slots = self.slots.lock().unwrap();
        while let Some(slot) = slots.pop_front() {
            if slot.reply.is_closed() {
                trace!(ticket = slot.ticket, "discarding abandoned proxy ticket");
                continue;
            }
            return Some(slot);
        }
        None
    }

    /// Drop tickets that expired or whose listener went away.
    /// Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        slots.retain(|slot| !slot.reply.is_closed() && slot.created.elapsed() <= max_age);
        before - slots.len()
    }

    /// Cancel every outstanding ticket; waiting listeners observe the
    /// dropped sender as "no backend available"
    pub fn cancel_all(&self) {
        self.slots.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }
}

impl Default for PendingProxies {
    fn default() -> Self {
        Self::new()
    }
}
