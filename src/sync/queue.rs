//! Bounded outbound queue with snapshot supersession.

use std::collections::VecDeque;

use super::message::{DeltaOp, SyncMessage};

/// Messages waiting for the transport. Sequence numbers are not assigned
/// here, so anything dropped from the queue never leaves a gap on the wire.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<SyncMessage>,
    capacity: usize,
    overflowed: bool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            overflowed: false,
        }
    }

    /// Enqueue `message`. A `FullSnapshot` replaces every queued snapshot and
    /// delta op except add handshakes; a full queue drops its oldest entry
    /// that is not an add handshake and flags the overflow.
    pub fn push(&mut self, message: SyncMessage) {
        if message.is_full_snapshot() {
            self.supersede();
            // The snapshot carries everything the lost messages did
            self.overflowed = false;
        } else if matches!(message, SyncMessage::ResyncRequest)
            && self.items.iter().any(|m| matches!(m, SyncMessage::ResyncRequest))
        {
            return;
        }

        if self.items.len() >= self.capacity && !self.evict_oldest() {
            if !message.carries_add_handshake() {
                log::warn!("Outbound queue full of add handshakes, dropped new {}", message.label());
                self.overflowed = true;
                return;
            }
            log::warn!("Outbound queue over capacity to keep an add handshake");
        }
        self.items.push_back(message);
    }

    fn supersede(&mut self) {
        let before = self.items.len();
        self.items.retain_mut(|m| match m {
            SyncMessage::FullSnapshot(_) => false,
            SyncMessage::Delta(ops) => {
                ops.retain(DeltaOp::is_add_handshake);
                !ops.is_empty()
            }
            SyncMessage::ResyncRequest => true,
        });
        let dropped = before - self.items.len();
        if dropped > 0 {
            log::debug!("Full snapshot superseded {} queued messages", dropped);
        }
    }

    /// Drop the oldest message a later snapshot can make up for.
    fn evict_oldest(&mut self) -> bool {
        let Some(pos) = self.items.iter().position(|m| !m.carries_add_handshake()) else {
            return false;
        };
        if let Some(dropped) = self.items.remove(pos) {
            log::warn!("Outbound queue full, dropped oldest {}", dropped.label());
        }
        self.overflowed = true;
        true
    }

    /// Put a message back at the head after a failed transmit.
    pub fn push_front(&mut self, message: SyncMessage) {
        if self.items.len() >= self.capacity {
            if let Some(pos) = self.items.iter().rposition(|m| !m.carries_add_handshake()) {
                self.items.remove(pos);
                self.overflowed = true;
            }
        }
        self.items.push_front(message);
    }

    pub fn pop_front(&mut self) -> Option<SyncMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Something was dropped that only a full snapshot can make up for.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncMessage> {
        self.items.iter()
    }
}
