//! Entity Store
//!
//! Exclusive owner of tally and version records. Committed state lives in an
//! immutable arena swapped on every successful commit; a single writer stages
//! mutations on a private copy until `commit`. Readers only ever see
//! committed arenas.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::migrations::{decode_current, migrate_image, CURRENT_SCHEMA_VERSION};
use super::traits::{ChangeSet, StorageMedium, StoredImage};
use crate::domain::{
    AppVersion, DomainError, DomainResult, EventKind, Mutation, TallyEvent, TallyId, TallyRecord, TallyStats,
    TallyType, VersionRecord,
};

/// How long a trashed tally can be restored before it is purged.
pub const TRASH_RETENTION_DAYS: i64 = 30;

/// What to do when a migration step fails. Chosen by the caller, never implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPolicy {
    /// Fail startup with `MigrationFailed`, leaving the old store untouched
    #[default]
    AbortPreservingStore,
    /// Start over with an empty store at the new schema (data loss)
    RebuildEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    UpToDate,
    Migrated { from: u32, to: u32 },
    /// The migration failed and the tallies were discarded
    RebuiltEmpty { from: u32, to: u32, cause: DomainError },
}

impl MigrationOutcome {
    pub fn lost_data(&self) -> bool {
        matches!(self, MigrationOutcome::RebuiltEmpty { .. })
    }
}

/// Counts of what one commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Tallies rewritten (0 if the tally set was untouched)
    pub tallies: usize,
    pub events: usize,
    pub versions: usize,
}

#[derive(Debug, Clone)]
pub(super) struct Arena {
    pub(super) schema_version: u32,
    pub(super) tallies: Vec<TallyRecord>,
    /// Soft-deleted, `deleted_at` always set, most recent last
    pub(super) trashed: Vec<TallyRecord>,
    pub(super) versions: Vec<VersionRecord>,
}

impl Arena {
    fn decode(image: StoredImage) -> DomainResult<Self> {
        let records = image
            .tallies
            .iter()
            .map(decode_current)
            .collect::<DomainResult<Vec<_>>>()?;

        let mut seen = HashSet::new();
        if let Some(dup) = records.iter().find(|t| !seen.insert(t.id)) {
            return Err(DomainError::StoreUnavailable(format!("duplicate tally id {}", dup.id)));
        }
        let (trashed, tallies): (Vec<_>, Vec<_>) = records.into_iter().partition(|t| t.deleted_at.is_some());

        Ok(Self {
            schema_version: image.schema_version,
            tallies,
            trashed,
            versions: image.versions,
        })
    }

    pub(super) fn position(&self, id: TallyId) -> Option<usize> {
        self.tallies.iter().position(|t| t.id == id)
    }

    fn trash_position(&self, id: TallyId) -> Option<usize> {
        self.trashed.iter().position(|t| t.id == id)
    }

    /// Live or trashed.
    fn find_any(&self, id: TallyId) -> Option<&TallyRecord> {
        self.tallies.iter().chain(&self.trashed).find(|t| t.id == id)
    }
}

/// Staged, uncommitted writes of the single writer.
#[derive(Default)]
pub(super) struct PendingWrites {
    pub(super) working: Option<Arena>,
    pub(super) tallies_dirty: bool,
    pub(super) new_versions: Vec<VersionRecord>,
    pub(super) new_events: Vec<TallyEvent>,
    pub(super) purged: Vec<TallyId>,
}

impl PendingWrites {
    pub(super) fn working_copy(&mut self, committed: &Arena) -> &mut Arena {
        self.working.get_or_insert_with(|| committed.clone())
    }

    /// What the writer sees: its working copy once it has one.
    fn view<'a>(&'a self, committed: &'a Arena) -> &'a Arena {
        self.working.as_ref().unwrap_or(committed)
    }

    fn is_empty(&self) -> bool {
        self.working.is_none()
    }

    fn change_set(&self) -> ChangeSet {
        ChangeSet {
            tallies: if self.tallies_dirty {
                self.working
                    .as_ref()
                    .map(|w| w.tallies.iter().chain(&w.trashed).cloned().collect())
            } else {
                None
            },
            new_versions: self.new_versions.clone(),
            new_events: self.new_events.clone(),
            purged: self.purged.clone(),
        }
    }
}

/// Store contents read before anything else is allowed to touch them.
///
/// Holding this is holding the store: until `into_store` succeeds there is no
/// `EntityStore` through which any other operation could run.
pub struct StoreAcquisition {
    medium: Arc<dyn StorageMedium>,
    image: StoredImage,
    outcome: MigrationOutcome,
}

impl StoreAcquisition {
    pub fn schema_version(&self) -> u32 {
        self.image.schema_version
    }

    pub fn versions(&self) -> &[VersionRecord] {
        &self.image.versions
    }

    pub fn latest_version(&self) -> Option<&VersionRecord> {
        VersionRecord::latest(&self.image.versions)
    }

    pub fn needs_migration(&self) -> bool {
        self.image.schema_version < CURRENT_SCHEMA_VERSION
    }

    /// Upgrade to `target`. Calling it again once there is a no-op.
    pub async fn migrate(&mut self, target: u32, policy: MigrationPolicy) -> DomainResult<MigrationOutcome> {
        let from = self.image.schema_version;
        if from >= target {
            return Ok(MigrationOutcome::UpToDate);
        }

        let attempt = match migrate_image(self.image.clone(), target) {
            Ok(upgraded) => match self.medium.replace(&upgraded).await {
                Ok(()) => Ok(upgraded),
                Err(e) => Err(DomainError::MigrationFailed {
                    from,
                    to: target,
                    reason: e.to_string(),
                }),
            },
            Err(e) => Err(e),
        };

        let outcome = match attempt {
            Ok(upgraded) => {
                log::info!("Store migrated from schema v{} to v{}", from, target);
                self.image = upgraded;
                MigrationOutcome::Migrated { from, to: target }
            }
            Err(cause) => match policy {
                MigrationPolicy::AbortPreservingStore => {
                    log::error!("Migration aborted, store left at v{}: {}", from, cause);
                    return Err(cause);
                }
                MigrationPolicy::RebuildEmpty => {
                    log::warn!("Migration failed, rebuilding empty store at v{}: {}", target, cause);
                    let fresh = StoredImage {
                        schema_version: target,
                        tallies: Vec::new(),
                        versions: self.image.versions.clone(),
                    };
                    self.medium.replace(&fresh).await.map_err(|e| {
                        DomainError::StoreUnavailable(format!("rebuild after failed migration: {}", e))
                    })?;
                    self.image = fresh;
                    MigrationOutcome::RebuiltEmpty {
                        from,
                        to: target,
                        cause,
                    }
                }
            },
        };

        self.outcome = outcome.clone();
        Ok(outcome)
    }

    /// Release the store for normal use. Refuses while a migration is still owed.
    pub fn into_store(self) -> DomainResult<(EntityStore, MigrationOutcome)> {
        if self.needs_migration() {
            return Err(DomainError::StoreUnavailable(format!(
                "store is at schema v{}, v{} required",
                self.image.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        let arena = Arena::decode(self.image)?;
        let store = EntityStore {
            medium: self.medium,
            committed: RwLock::new(Arc::new(arena)),
            writer: Mutex::new(PendingWrites::default()),
        };
        Ok((store, self.outcome))
    }
}

/// Durable keyed storage of tallies and version records
pub struct EntityStore {
    medium: Arc<dyn StorageMedium>,
    committed: RwLock<Arc<Arena>>,
    pub(super) writer: Mutex<PendingWrites>,
}

impl EntityStore {
    /// Read the medium without opening the store for use.
    pub async fn acquire(medium: Arc<dyn StorageMedium>) -> DomainResult<StoreAcquisition> {
        let image = medium.load().await.map_err(|e| match e {
            DomainError::StoreUnavailable(_) => e,
            other => DomainError::StoreUnavailable(other.to_string()),
        })?;

        if image.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(DomainError::StoreUnavailable(format!(
                "store schema v{} is newer than supported v{}",
                image.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }

        Ok(StoreAcquisition {
            medium,
            image,
            outcome: MigrationOutcome::UpToDate,
        })
    }

    /// Acquire, migrate if the schema is behind, and open.
    pub async fn open(
        medium: Arc<dyn StorageMedium>,
        policy: MigrationPolicy,
    ) -> DomainResult<(Self, MigrationOutcome)> {
        let mut acquisition = Self::acquire(medium).await?;
        if acquisition.needs_migration() {
            acquisition.migrate(CURRENT_SCHEMA_VERSION, policy).await?;
        }
        acquisition.into_store()
    }

    pub(super) async fn committed(&self) -> Arc<Arena> {
        self.committed.read().await.clone()
    }

    /// Run `f` over the committed tallies without copying the arena.
    pub async fn with_committed<R>(&self, f: impl FnOnce(&[TallyRecord]) -> R) -> R {
        let guard = self.committed.read().await;
        f(guard.tallies.as_slice())
    }

    /// Committed tallies in canonical order.
    pub async fn fetch_all(&self) -> Vec<TallyRecord> {
        self.committed.read().await.tallies.clone()
    }

    pub async fn fetch(&self, id: TallyId) -> DomainResult<TallyRecord> {
        self.committed
            .read()
            .await
            .tallies
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(DomainError::RecordNotFound(id))
    }

    pub async fn len(&self) -> usize {
        self.committed.read().await.tallies.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn current_schema_version(&self) -> u32 {
        self.committed.read().await.schema_version
    }

    /// Stage a new tally at the end of the canonical order.
    pub async fn create(&self, title: impl Into<String>, color_index: i32) -> DomainResult<TallyRecord> {
        self.create_with_type(title, color_index, TallyType::default()).await
    }

    pub async fn create_with_type(
        &self,
        title: impl Into<String>,
        color_index: i32,
        tally_type: TallyType,
    ) -> DomainResult<TallyRecord> {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;

        let mut record = TallyRecord::new(title, color_index, Utc::now());
        record.tally_type = tally_type;

        pending.working_copy(&committed).tallies.push(record.clone());
        pending.tallies_dirty = true;
        Ok(record)
    }

    /// Stage an edit. Returns the updated record, or `None` after a delete.
    pub async fn mutate(&self, id: TallyId, mutation: Mutation) -> DomainResult<Option<TallyRecord>> {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;
        let pos = pending
            .view(&committed)
            .position(id)
            .ok_or(DomainError::RecordNotFound(id))?;
        let now = Utc::now();

        let PendingWrites {
            working,
            tallies_dirty,
            new_events,
            purged,
            ..
        } = &mut *pending;
        let arena = working.get_or_insert_with(|| (*committed).clone());

        if mutation == Mutation::Delete {
            arena.tallies.remove(pos);
            new_events.retain(|e| e.tally_id != id);
            purged.push(id);
            *tallies_dirty = true;
            return Ok(None);
        }

        let record = &mut arena.tallies[pos];
        let event = match mutation {
            Mutation::Increment => TallyEvent::record(id, EventKind::Increment, record.increment(), now),
            Mutation::Decrement => TallyEvent::record(id, EventKind::Decrement, record.decrement(), now),
            Mutation::AdjustBy { by } => TallyEvent::record(id, EventKind::Set, record.adjust_by(by), now),
            Mutation::Reset => TallyEvent::record(id, EventKind::Reset, record.reset(), now),
            Mutation::Rename { title } => {
                record.title = title;
                None
            }
            Mutation::ToggleCollapsed => {
                record.is_collapsed = !record.is_collapsed;
                None
            }
            Mutation::SetCollapsed { collapsed } => {
                record.is_collapsed = collapsed;
                None
            }
            Mutation::SetColor { color_index } => {
                record.color_index = color_index;
                None
            }
            Mutation::Delete => None,
        };

        let updated = record.clone();
        new_events.extend(event);
        *tallies_dirty = true;
        Ok(Some(updated))
    }

    /// Stage a reorder: move `id` to `position` in the canonical order.
    pub async fn move_to(&self, id: TallyId, position: usize) -> DomainResult<()> {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;

        let view = pending.view(&committed);
        let from = view.position(id).ok_or(DomainError::RecordNotFound(id))?;
        if position >= view.tallies.len() {
            return Err(DomainError::InvalidInput(format!(
                "position {} out of range for {} tallies",
                position,
                view.tallies.len()
            )));
        }

        let arena = pending.working_copy(&committed);
        let record = arena.tallies.remove(from);
        arena.tallies.insert(position, record);
        pending.tallies_dirty = true;
        Ok(())
    }

    /// Stage removal of every tally. Returns how many were removed.
    pub async fn delete_all(&self) -> usize {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;
        if pending.view(&committed).tallies.is_empty() {
            return 0;
        }

        let removed: Vec<TallyId> = pending
            .working_copy(&committed)
            .tallies
            .drain(..)
            .map(|t| t.id)
            .collect();
        pending.new_events.clear();
        pending.purged.extend(removed.iter().copied());
        pending.tallies_dirty = true;
        removed.len()
    }

    /// Stage a version record unless one already exists for that version.
    pub async fn insert_version_if_absent(&self, version: &AppVersion) -> bool {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;

        let record = VersionRecord::new(version, Utc::now());
        if pending
            .view(&committed)
            .versions
            .iter()
            .any(|v| v.version_number == record.version_number)
        {
            return false;
        }
        pending.working_copy(&committed).versions.push(record.clone());
        pending.new_versions.push(record);
        true
    }

    /// Stage moving a tally to the trash. It leaves the canonical order but
    /// keeps its history until purged.
    pub async fn trash(&self, id: TallyId) -> DomainResult<TallyRecord> {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;
        let pos = pending
            .view(&committed)
            .position(id)
            .ok_or(DomainError::RecordNotFound(id))?;

        let arena = pending.working_copy(&committed);
        let mut record = arena.tallies.remove(pos);
        record.deleted_at = Some(Utc::now());
        arena.trashed.push(record.clone());
        pending.tallies_dirty = true;
        Ok(record)
    }

    /// Stage putting a trashed tally back at the end of the canonical order.
    pub async fn restore_from_trash(&self, id: TallyId) -> DomainResult<TallyRecord> {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;
        let pos = pending
            .view(&committed)
            .trash_position(id)
            .ok_or(DomainError::RecordNotFound(id))?;

        let arena = pending.working_copy(&committed);
        let mut record = arena.trashed.remove(pos);
        record.deleted_at = None;
        arena.tallies.push(record.clone());
        pending.tallies_dirty = true;
        Ok(record)
    }

    /// Stage permanent removal of a trashed tally and its history.
    pub async fn purge_trashed(&self, id: TallyId) -> DomainResult<()> {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;
        let pos = pending
            .view(&committed)
            .trash_position(id)
            .ok_or(DomainError::RecordNotFound(id))?;

        pending.working_copy(&committed).trashed.remove(pos);
        pending.new_events.retain(|e| e.tally_id != id);
        pending.purged.push(id);
        pending.tallies_dirty = true;
        Ok(())
    }

    /// Stage purging everything trashed longer than the retention window
    /// before `now`. Returns how many were purged.
    pub async fn purge_expired_trash(&self, now: DateTime<Utc>) -> usize {
        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;
        let cutoff = now - Duration::days(TRASH_RETENTION_DAYS);
        let expired = |t: &TallyRecord| t.deleted_at.map(|at| at < cutoff).unwrap_or(false);
        if !pending.view(&committed).trashed.iter().any(|t| expired(t)) {
            return 0;
        }

        let arena = pending.working_copy(&committed);
        let gone: Vec<TallyId> = arena.trashed.iter().filter(|t| expired(t)).map(|t| t.id).collect();
        arena.trashed.retain(|t| !expired(t));
        pending.new_events.retain(|e| !gone.contains(&e.tally_id));
        pending.purged.extend(gone.iter().copied());
        pending.tallies_dirty = true;
        log::info!("Purging {} tallies trashed before {}", gone.len(), cutoff);
        gone.len()
    }

    /// Committed trash, most recently deleted first.
    pub async fn trashed(&self) -> Vec<TallyRecord> {
        let mut trashed = self.committed.read().await.trashed.clone();
        trashed.reverse();
        trashed.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        trashed
    }

    pub async fn has_pending(&self) -> bool {
        !self.writer.lock().await.is_empty()
    }

    /// Drop every staged, uncommitted write.
    pub async fn discard(&self) {
        *self.writer.lock().await = PendingWrites::default();
    }

    /// Durably persist every staged write as one unit.
    ///
    /// On failure the staged writes are kept, so the caller can retry the
    /// same commit, and readers keep seeing the previous committed state.
    pub async fn commit(&self) -> DomainResult<CommitSummary> {
        let mut pending = self.writer.lock().await;
        if pending.is_empty() {
            return Ok(CommitSummary::default());
        }

        let changes = pending.change_set();
        self.medium.apply(&changes).await.map_err(|e| match e {
            DomainError::CommitFailed(_) => e,
            other => DomainError::CommitFailed(other.to_string()),
        })?;

        let summary = CommitSummary {
            tallies: changes.tallies.as_ref().map(Vec::len).unwrap_or(0),
            events: changes.new_events.len(),
            versions: changes.new_versions.len(),
        };

        if let Some(next) = pending.working.take() {
            *self.committed.write().await = Arc::new(next);
        }
        *pending = PendingWrites::default();

        log::debug!(
            "Committed {} tallies, {} events, {} versions",
            summary.tallies,
            summary.events,
            summary.versions
        );
        Ok(summary)
    }

    /// Bring an open store to `target`. An open store is always at the code's
    /// schema, so this is a no-op unless asked for a schema that does not exist.
    pub async fn migrate(&self, target: u32) -> DomainResult<MigrationOutcome> {
        let _writer = self.writer.lock().await;
        let committed = self.committed.write().await;

        if committed.schema_version >= target {
            return Ok(MigrationOutcome::UpToDate);
        }
        Err(DomainError::MigrationFailed {
            from: committed.schema_version,
            to: target,
            reason: format!("no migration path beyond v{}", CURRENT_SCHEMA_VERSION),
        })
    }

    pub async fn versions(&self) -> Vec<VersionRecord> {
        self.committed.read().await.versions.clone()
    }

    pub async fn latest_version(&self) -> Option<VersionRecord> {
        VersionRecord::latest(&self.committed.read().await.versions).cloned()
    }

    /// Committed history for one tally, newest first. Trashed tallies keep
    /// theirs until purged.
    pub async fn history(&self, id: TallyId) -> DomainResult<Vec<TallyEvent>> {
        if self.committed.read().await.find_any(id).is_none() {
            return Err(DomainError::RecordNotFound(id));
        }
        self.medium.events_for(id).await
    }

    /// History with timestamps in `from..=to`, newest first.
    pub async fn history_between(
        &self,
        id: TallyId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<TallyEvent>> {
        if from > to {
            return Err(DomainError::InvalidInput(format!("history range {} is after {}", from, to)));
        }
        let mut events = self.history(id).await?;
        events.retain(|e| e.timestamp >= from && e.timestamp <= to);
        Ok(events)
    }

    /// Statistics over the committed history of one tally.
    pub async fn stats(&self, id: TallyId) -> DomainResult<TallyStats> {
        let counter = self
            .committed
            .read()
            .await
            .find_any(id)
            .map(|t| t.counter)
            .ok_or(DomainError::RecordNotFound(id))?;
        let events = self.medium.events_for(id).await?;
        Ok(TallyStats::from_events(id, counter, &events, Utc::now()))
    }
}
