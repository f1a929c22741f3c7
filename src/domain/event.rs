//! Tally history events, one per committed counter change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tally::TallyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Increment,
    Decrement,
    Reset,
    /// Counter set from outside (sync adjustment, restore)
    Set,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Increment => "increment",
            EventKind::Decrement => "decrement",
            EventKind::Reset => "reset",
            EventKind::Set => "set",
        }
    }

    pub fn from_tag(s: &str) -> Self {
        match s {
            "increment" => EventKind::Increment,
            "decrement" => EventKind::Decrement,
            "reset" => EventKind::Reset,
            _ => EventKind::Set,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyEvent {
    pub tally_id: TallyId,
    pub kind: EventKind,
    /// Applied change; never zero
    pub delta: i64,
    pub timestamp: DateTime<Utc>,
}

impl TallyEvent {
    /// Returns `None` when nothing actually changed (e.g. decrement at zero).
    pub fn record(tally_id: TallyId, kind: EventKind, delta: i64, timestamp: DateTime<Utc>) -> Option<Self> {
        (delta != 0).then_some(Self {
            tally_id,
            kind,
            delta,
            timestamp,
        })
    }
}
