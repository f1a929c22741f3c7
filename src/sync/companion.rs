//! Companion-side mirror of the primary's tallies.
//!
//! The authoritative part changes only through inbound messages. Local edits
//! live in an optimistic overlay until the primary's answer replaces them.

use std::collections::HashMap;
use std::sync::Arc;

use super::message::{AddToken, DeltaOp, Envelope, SyncMessage};
use super::primary::Outbox;
use super::SyncError;
use crate::domain::TallyId;
use crate::snapshot::TallyValue;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingAdd {
    token: AddToken,
    title: String,
    color_index: i32,
}

/// One row of the companion's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEntry {
    /// `None` until the primary confirms an add
    pub id: Option<TallyId>,
    pub title: String,
    pub counter: i64,
    pub color_index: i32,
    pub is_collapsed: bool,
    /// Shows local edits the primary has not confirmed
    pub pending: bool,
}

pub struct CompanionMirror {
    outbox: Arc<dyn Outbox>,
    authoritative: Vec<TallyValue>,
    pending_adds: Vec<PendingAdd>,
    pending_adjust: HashMap<TallyId, i64>,
}

impl CompanionMirror {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            outbox,
            authoritative: Vec::new(),
            pending_adds: Vec::new(),
            pending_adjust: HashMap::new(),
        }
    }

    /// Primary state as last received.
    pub fn authoritative(&self) -> &[TallyValue] {
        &self.authoritative
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_adds.is_empty() || !self.pending_adjust.is_empty()
    }

    /// Add a tally from the companion UI. Shown at once, confirmed later.
    pub fn add(&mut self, title: impl Into<String>, color_index: i32) -> Result<AddToken, SyncError> {
        let token = AddToken::new();
        let title = title.into();
        self.outbox.send(SyncMessage::Delta(vec![DeltaOp::Add {
            token,
            title: title.clone(),
            color_index,
        }]))?;
        self.pending_adds.push(PendingAdd {
            token,
            title,
            color_index,
        });
        Ok(token)
    }

    pub fn increment(&mut self, id: TallyId) -> Result<(), SyncError> {
        self.adjust(id, 1)
    }

    pub fn decrement(&mut self, id: TallyId) -> Result<(), SyncError> {
        self.adjust(id, -1)
    }

    /// Optimistic counter change, floored at zero like the primary does.
    pub fn adjust(&mut self, id: TallyId, by: i64) -> Result<(), SyncError> {
        let Some(base) = self.authoritative.iter().find(|v| v.id == id).map(|v| v.counter) else {
            log::warn!("Companion edit for unknown tally {}", id);
            return Ok(());
        };
        let shown = (base + self.pending_adjust.get(&id).copied().unwrap_or(0)).max(0);
        let applied = (shown + by).max(0) - shown;
        if applied == 0 {
            return Ok(());
        }

        self.outbox
            .send(SyncMessage::Delta(vec![DeltaOp::AdjustBy { id, by: applied }]))?;
        *self.pending_adjust.entry(id).or_insert(0) += applied;
        Ok(())
    }

    pub fn request_resync(&self) -> Result<(), SyncError> {
        self.outbox.send(SyncMessage::ResyncRequest)
    }

    /// Apply one message from the primary. Its word replaces any local
    /// optimistic state for the records it mentions.
    pub fn apply(&mut self, envelope: Envelope) {
        match envelope.message {
            SyncMessage::FullSnapshot(snapshot) => {
                self.authoritative = snapshot.into_entries();
                self.pending_adjust.clear();
            }
            SyncMessage::Delta(ops) => {
                for op in ops {
                    self.apply_op(op);
                }
            }
            SyncMessage::ResyncRequest => {
                log::debug!("Companion does not serve resync requests");
            }
        }
    }

    fn apply_op(&mut self, op: DeltaOp) {
        if let Some(id) = op.target() {
            self.pending_adjust.remove(&id);
        }

        match op {
            DeltaOp::AdjustBy { id, by } => {
                if let Some(v) = self.find(id) {
                    v.counter = v.counter.saturating_add(by).max(0);
                }
            }
            DeltaOp::Rename { id, title } => {
                if let Some(v) = self.find(id) {
                    v.title = title;
                }
            }
            DeltaOp::SetCollapsed { id, collapsed } => {
                if let Some(v) = self.find(id) {
                    v.is_collapsed = collapsed;
                }
            }
            DeltaOp::SetColor { id, color_index } => {
                if let Some(v) = self.find(id) {
                    v.color_index = color_index;
                }
            }
            DeltaOp::Remove { id } => self.authoritative.retain(|v| v.id != id),
            DeltaOp::Reorder { order } => {
                let mut reordered = Vec::with_capacity(self.authoritative.len());
                for id in &order {
                    if let Some(pos) = self.authoritative.iter().position(|v| v.id == *id) {
                        reordered.push(self.authoritative.remove(pos));
                    }
                }
                // Anything the order did not mention keeps its relative place at the end
                reordered.append(&mut self.authoritative);
                self.authoritative = reordered;
            }
            DeltaOp::Confirmed { token, value } => {
                self.pending_adds.retain(|p| p.token != token);
                if self.find(value.id).is_none() {
                    self.authoritative.push(value);
                }
            }
            DeltaOp::Add { .. } => log::warn!("Ignoring add sent by primary"),
        }
    }

    fn find(&mut self, id: TallyId) -> Option<&mut TallyValue> {
        self.authoritative.iter_mut().find(|v| v.id == id)
    }

    /// What the companion UI shows: primary state, local adjustments, then
    /// unconfirmed adds.
    pub fn view(&self) -> Vec<MirrorEntry> {
        let confirmed = self.authoritative.iter().map(|v| {
            let adjust = self.pending_adjust.get(&v.id).copied();
            MirrorEntry {
                id: Some(v.id),
                title: v.title.clone(),
                counter: (v.counter + adjust.unwrap_or(0)).max(0),
                color_index: v.color_index,
                is_collapsed: v.is_collapsed,
                pending: adjust.is_some(),
            }
        });
        let unconfirmed = self.pending_adds.iter().map(|p| MirrorEntry {
            id: None,
            title: p.title.clone(),
            counter: 0,
            color_index: p.color_index,
            is_collapsed: false,
            pending: true,
        });
        confirmed.chain(unconfirmed).collect()
    }

    /// Parallel title list for list-style watch UIs.
    pub fn titles(&self) -> Vec<String> {
        self.view().into_iter().map(|e| e.title).collect()
    }

    pub fn counts(&self) -> Vec<i64> {
        self.view().into_iter().map(|e| e.counter).collect()
    }
}
