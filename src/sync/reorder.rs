//! Inbound reordering by sequence number.

use std::collections::BTreeMap;

use super::message::Envelope;

pub const FIRST_SEQ: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Delivered, possibly along with buffered successors
    Accepted,
    /// Held until the missing predecessors arrive
    Buffered,
    /// Already delivered or superseded
    Stale,
}

/// Releases envelopes strictly in ascending sequence order.
#[derive(Debug)]
pub struct ReorderBuffer {
    expected: u64,
    held: BTreeMap<u64, Envelope>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            expected: FIRST_SEQ,
            held: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Envelopes waiting behind a gap.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn has_gap(&self) -> bool {
        !self.held.is_empty()
    }

    /// Forget everything, e.g. after a new handshake.
    pub fn reset(&mut self) {
        self.expected = FIRST_SEQ;
        self.held.clear();
    }

    /// Take one envelope; whatever became deliverable is appended to `ready`.
    ///
    /// A full snapshot makes everything before it irrelevant, so it jumps the
    /// expected sequence instead of waiting for the gap to fill.
    pub fn insert(&mut self, envelope: Envelope, ready: &mut Vec<Envelope>) -> Arrival {
        let seq = envelope.seq;
        if seq < self.expected || self.held.contains_key(&seq) {
            return Arrival::Stale;
        }

        if envelope.message.is_full_snapshot() && seq > self.expected {
            log::info!("Full snapshot #{} skips ahead of #{}", seq, self.expected);
            self.held = self.held.split_off(&seq);
            self.expected = seq;
        }

        if seq != self.expected {
            self.held.insert(seq, envelope);
            return Arrival::Buffered;
        }

        ready.push(envelope);
        self.expected += 1;
        while let Some(next) = self.held.remove(&self.expected) {
            ready.push(next);
            self.expected += 1;
        }
        Arrival::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::sync::{DeviceId, SyncMessage};

    fn envelope(seq: u64, message: SyncMessage) -> Envelope {
        Envelope {
            seq,
            origin: DeviceId::new("primary"),
            message,
        }
    }

    fn delta(seq: u64) -> Envelope {
        envelope(seq, SyncMessage::Delta(Vec::new()))
    }

    fn seqs(ready: &[Envelope]) -> Vec<u64> {
        ready.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn test_out_of_order_is_released_in_order() {
        let mut buffer = ReorderBuffer::new();
        let mut ready = Vec::new();

        assert_eq!(buffer.insert(delta(2), &mut ready), Arrival::Buffered);
        assert_eq!(buffer.insert(delta(3), &mut ready), Arrival::Buffered);
        assert!(buffer.has_gap());
        assert!(ready.is_empty());

        assert_eq!(buffer.insert(delta(1), &mut ready), Arrival::Accepted);
        assert_eq!(seqs(&ready), vec![1, 2, 3]);
        assert!(!buffer.has_gap());
        assert_eq!(buffer.expected(), 4);
    }

    #[test]
    fn test_duplicates_are_stale() {
        let mut buffer = ReorderBuffer::new();
        let mut ready = Vec::new();
        buffer.insert(delta(1), &mut ready);
        assert_eq!(buffer.insert(delta(1), &mut ready), Arrival::Stale);
        buffer.insert(delta(3), &mut ready);
        assert_eq!(buffer.insert(delta(3), &mut ready), Arrival::Stale);
        assert_eq!(seqs(&ready), vec![1]);
    }

    #[test]
    fn test_full_snapshot_jumps_the_gap() {
        let mut buffer = ReorderBuffer::new();
        let mut ready = Vec::new();
        buffer.insert(delta(1), &mut ready);
        buffer.insert(delta(3), &mut ready);
        buffer.insert(delta(6), &mut ready);

        let full = envelope(5, SyncMessage::FullSnapshot(Snapshot::default()));
        assert_eq!(buffer.insert(full, &mut ready), Arrival::Accepted);
        assert_eq!(seqs(&ready), vec![1, 5, 6]);
        assert!(!buffer.has_gap());

        // Late arrivals from before the snapshot are ignored
        assert_eq!(buffer.insert(delta(4), &mut ready), Arrival::Stale);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut buffer = ReorderBuffer::new();
        let mut ready = Vec::new();
        buffer.insert(delta(1), &mut ready);
        buffer.insert(delta(4), &mut ready);
        buffer.reset();
        assert_eq!(buffer.expected(), FIRST_SEQ);
        assert_eq!(buffer.insert(delta(1), &mut ready), Arrival::Accepted);
    }
}
