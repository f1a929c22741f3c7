//! Tally Entity
//!
//! A named counter with display state (collapsed/expanded, color).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable tally identifier, assigned at creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TallyId(Uuid);

impl TallyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TallyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TallyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record variant; changes display behavior only, never the storage shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TallyType {
    /// Tally marks (IIII with a stroke for five)
    #[default]
    Tally,
    /// Plain numeric counter
    Counter,
}

impl TallyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TallyType::Tally => "tally",
            TallyType::Counter => "counter",
        }
    }

    /// Lenient parse: anything unknown is a tally.
    pub fn from_tag(s: &str) -> Self {
        match s {
            "counter" => TallyType::Counter,
            _ => TallyType::Tally,
        }
    }
}

/// A persisted tally.
///
/// Invariant: `counter >= 0`. Every counter-changing method floors at zero
/// and returns the delta it actually applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyRecord {
    pub id: TallyId,
    pub title: String,
    pub counter: i64,
    pub color_index: i32,
    pub is_collapsed: bool,
    #[serde(rename = "type")]
    pub tally_type: TallyType,
    pub created_at: DateTime<Utc>,
    /// Set while the tally sits in the trash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TallyRecord {
    /// Create a fresh tally at zero, expanded.
    pub fn new(title: impl Into<String>, color_index: i32, created_at: DateTime<Utc>) -> Self {
        Self {
            id: TallyId::new(),
            title: title.into(),
            counter: 0,
            color_index,
            is_collapsed: false,
            tally_type: TallyType::default(),
            created_at,
            deleted_at: None,
        }
    }

    pub fn increment(&mut self) -> i64 {
        self.adjust_by(1)
    }

    pub fn decrement(&mut self) -> i64 {
        self.adjust_by(-1)
    }

    /// Add `by` (possibly negative), flooring at zero.
    pub fn adjust_by(&mut self, by: i64) -> i64 {
        let before = self.counter;
        self.counter = self.counter.saturating_add(by).max(0);
        self.counter - before
    }

    pub fn reset(&mut self) -> i64 {
        let before = self.counter;
        self.counter = 0;
        -before
    }
}

/// An in-place edit applied through the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Mutation {
    Increment,
    /// Floors at zero
    Decrement,
    AdjustBy { by: i64 },
    Reset,
    Rename { title: String },
    ToggleCollapsed,
    SetCollapsed { collapsed: bool },
    SetColor { color_index: i32 },
    Delete,
}

impl Mutation {
    pub fn changes_counter(&self) -> bool {
        matches!(
            self,
            Mutation::Increment | Mutation::Decrement | Mutation::AdjustBy { .. } | Mutation::Reset
        )
    }
}
