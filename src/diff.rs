//! Diff Engine
//!
//! Coarse classification of how two ordered snapshots differ, and the
//! full-vs-delta decision built on top of it. The classification only says
//! whether a resync is needed and how coarse it must be; it never computes an
//! edit script.

use serde::{Deserialize, Serialize};

use crate::config::SyncSettings;
use crate::snapshot::Snapshot;
use crate::sync::DeltaOp;

/// Who produced the newer snapshot. Carried on the result, never consulted by
/// the classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OriginHint {
    #[default]
    Primary,
    Companion,
    /// Another writer of compatible data, by label
    Foreign(String),
}

impl OriginHint {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "" | "primary" | "app" | "iphone" => OriginHint::Primary,
            "companion" | "watch" => OriginHint::Companion,
            _ => OriginHint::Foreign(label.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Same length, every title equal at the same position
    Identical,
    /// Lengths differ; reported even if titles differ too
    CountChanged,
    /// Same length, at least one positional title differs
    ContentChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    pub kind: ChangeKind,
    pub origin: OriginHint,
}

impl DiffResult {
    pub fn is_identical(&self) -> bool {
        self.kind == ChangeKind::Identical
    }
}

/// What the primary should send after a local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    UpToDate,
    Delta(Vec<DeltaOp>),
    FullSnapshot,
}

/// Limits for choosing a delta over a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    /// More renamed positions than this forces a full snapshot
    pub rename_threshold: usize,
    /// More touched records than this forces a full snapshot
    pub max_delta_records: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            rename_threshold: 1,
            max_delta_records: 8,
        }
    }
}

impl From<&SyncSettings> for PlanLimits {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            rename_threshold: settings.rename_threshold,
            max_delta_records: settings.max_delta_records,
        }
    }
}

pub struct DiffEngine;

impl DiffEngine {
    /// Length first, then titles position by position.
    pub fn classify(old: &Snapshot, new: &Snapshot, origin: OriginHint) -> DiffResult {
        let kind = if old.len() != new.len() {
            ChangeKind::CountChanged
        } else if old.titles().zip(new.titles()).any(|(a, b)| a != b) {
            ChangeKind::ContentChanged
        } else {
            ChangeKind::Identical
        };
        DiffResult { kind, origin }
    }

    /// Decide between nothing, a delta and a full snapshot.
    pub fn plan(old: &Snapshot, new: &Snapshot, limits: PlanLimits) -> SyncPlan {
        let diff = Self::classify(old, new, OriginHint::Primary);
        if diff.kind == ChangeKind::CountChanged {
            return SyncPlan::FullSnapshot;
        }

        let mut ops = Vec::new();
        let mut renamed = 0;
        let mut touched = 0;

        for (before, after) in old.entries().iter().zip(new.entries()) {
            // Same titles can still hide a reorder or a replaced record
            if before.id != after.id {
                return SyncPlan::FullSnapshot;
            }

            let start = ops.len();
            if before.counter != after.counter {
                ops.push(DeltaOp::AdjustBy {
                    id: after.id,
                    by: after.counter - before.counter,
                });
            }
            if before.title != after.title {
                renamed += 1;
                ops.push(DeltaOp::Rename {
                    id: after.id,
                    title: after.title.clone(),
                });
            }
            if before.is_collapsed != after.is_collapsed {
                ops.push(DeltaOp::SetCollapsed {
                    id: after.id,
                    collapsed: after.is_collapsed,
                });
            }
            if before.color_index != after.color_index {
                ops.push(DeltaOp::SetColor {
                    id: after.id,
                    color_index: after.color_index,
                });
            }
            if ops.len() > start {
                touched += 1;
            }
        }

        if renamed > limits.rename_threshold || touched > limits.max_delta_records {
            SyncPlan::FullSnapshot
        } else if ops.is_empty() {
            SyncPlan::UpToDate
        } else {
            SyncPlan::Delta(ops)
        }
    }
}
