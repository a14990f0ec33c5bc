use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use tracing::warn;
use xiangqi_proto::MessageKind;

use crate::registry::ConnHandle;

/// One outstanding message produced by a background component (the AI
/// bridge's reply, an opponent-side fan-out issued from a worker other than
/// the one the caller is servicing) addressed to a connection the event
/// loop thread will write to (§4.9).
pub struct Outbound {
    pub destination: ConnHandle,
    pub message: MessageKind,
}

/// Default capacity past which the mailbox refuses new entries rather than
/// blocking the producing worker (§4.9 "Bound and overflow policy").
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
#[error("outbound mailbox is full")]
pub struct MailboxFull;

/// Bounded, thread-safe FIFO of `(destination, message)` pairs. Background
/// producers (notably the AI bridge) never write to sockets directly; they
/// enqueue here, and the event loop drains the mailbox on every wake before
/// polling for readiness (§4.4 step 1), preserving the single-writer-per-
/// connection invariant even with multiple concurrent producers.
pub struct OutboundMailbox {
    capacity: usize,
    queue: Mutex<VecDeque<Outbound>>,
    not_empty: Condvar,
}

impl OutboundMailbox {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, queue: Mutex::new(VecDeque::new()), not_empty: Condvar::new() }
    }

    /// Enqueues one entry, returning `MailboxFull` rather than blocking if
    /// the mailbox is at capacity.
    pub fn try_enqueue(&self, destination: ConnHandle, message: MessageKind) -> Result<(), MailboxFull> {
        let mut q = self.queue.lock().expect("mailbox mutex poisoned");
        if q.len() >= self.capacity {
            return Err(MailboxFull);
        }
        q.push_back(Outbound { destination, message });
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues `destination`/`message`, logging and dropping it on overflow
    /// rather than propagating the error — a dropped AI-move reply is
    /// recoverable (the human can still move) but a stalled worker is not.
    pub fn enqueue_or_drop(&self, destination: ConnHandle, message: MessageKind) {
        if self.try_enqueue(destination, message.clone()).is_err() {
            warn!(destination, token = message.token(), "outbound mailbox full, dropping message");
        }
    }

    /// Drains every entry currently queued, for the event loop's per-wake
    /// flush (§4.4). Non-blocking: returns immediately with whatever was
    /// queued, possibly empty.
    pub fn drain(&self) -> Vec<Outbound> {
        let mut q = self.queue.lock().expect("mailbox mutex poisoned");
        q.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("mailbox mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OutboundMailbox {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_entries_in_fifo_order() {
        let mailbox = OutboundMailbox::new(8);
        mailbox.try_enqueue(1, MessageKind::Resign).unwrap();
        mailbox.try_enqueue(2, MessageKind::DrawRequest).unwrap();
        let drained = mailbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].destination, 1);
        assert_eq!(drained[1].destination, 2);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn overflow_is_rejected_once_full() {
        let mailbox = OutboundMailbox::new(1);
        mailbox.try_enqueue(1, MessageKind::Resign).unwrap();
        assert!(mailbox.try_enqueue(2, MessageKind::Resign).is_err());
    }
}
