//! Repository Layer - Core Traits
//!
//! Defines the abstract persistence medium behind the entity store.
//! Implementations can use SQLite, in-memory, etc.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{DomainResult, TallyEvent, TallyId, TallyRecord, VersionRecord};

/// A tally as persisted, at whatever schema version the medium holds.
///
/// Kept schema-agnostic so migration steps can be pure transforms.
pub type RawRecord = Map<String, Value>;

/// Everything the medium holds except history events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredImage {
    pub schema_version: u32,
    /// Canonical order
    pub tallies: Vec<RawRecord>,
    pub versions: Vec<VersionRecord>,
}

impl StoredImage {
    pub fn empty(schema_version: u32) -> Self {
        Self {
            schema_version,
            tallies: Vec::new(),
            versions: Vec::new(),
        }
    }
}

/// One commit's worth of durable changes, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Full canonical tally list, present whenever any tally changed
    pub tallies: Option<Vec<TallyRecord>>,
    pub new_versions: Vec<VersionRecord>,
    pub new_events: Vec<TallyEvent>,
    /// Tallies whose history should be dropped (deleted tallies)
    pub purged: Vec<TallyId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.tallies.is_none()
            && self.new_versions.is_empty()
            && self.new_events.is_empty()
            && self.purged.is_empty()
    }
}

/// Durable record medium
///
/// Every write method is all-or-nothing: on error the previously durable
/// state must still be what `load` returns.
#[async_trait]
pub trait StorageMedium: Send + Sync {
    /// Read the whole image. `StoreUnavailable` if the medium cannot be read.
    async fn load(&self) -> DomainResult<StoredImage>;

    /// Apply one commit. `CommitFailed` on any I/O error.
    async fn apply(&self, changes: &ChangeSet) -> DomainResult<()>;

    /// Replace everything, schema version included (migration, rebuild).
    async fn replace(&self, image: &StoredImage) -> DomainResult<()>;

    /// History for one tally, newest first.
    async fn events_for(&self, id: TallyId) -> DomainResult<Vec<TallyEvent>>;
}
