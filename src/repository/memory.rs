//! In-memory storage medium with fault injection.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::migrations::{encode_current, CURRENT_SCHEMA_VERSION};
use super::traits::{ChangeSet, StorageMedium, StoredImage};
use crate::domain::{DomainError, DomainResult, TallyEvent, TallyId};

#[derive(Default)]
struct MemoryState {
    image: StoredImage,
    events: Vec<TallyEvent>,
}

/// Volatile medium; every write is atomic because it swaps a whole value.
pub struct MemoryMedium {
    state: Mutex<MemoryState>,
    fail_load: AtomicBool,
    failing_applies: AtomicUsize,
    fail_replace: AtomicBool,
    applies: AtomicUsize,
}

impl MemoryMedium {
    /// Empty medium at the current schema.
    pub fn new() -> Self {
        Self::with_image(StoredImage::empty(CURRENT_SCHEMA_VERSION))
    }

    /// Medium pre-loaded with an image, e.g. a legacy store.
    pub fn with_image(image: StoredImage) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                image,
                events: Vec::new(),
            }),
            fail_load: AtomicBool::new(false),
            failing_applies: AtomicUsize::new(0),
            fail_replace: AtomicBool::new(false),
            applies: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_apply(&self) {
        self.fail_next_applies(1);
    }

    /// Fail the next `count` applies, e.g. a disk that stays full for a while.
    pub fn fail_next_applies(&self, count: usize) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_replace(&self) {
        self.fail_replace.store(true, Ordering::SeqCst);
    }

    /// Current durable image.
    pub fn image(&self) -> StoredImage {
        self.lock().image.clone()
    }

    /// Number of successful `apply` calls.
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageMedium for MemoryMedium {
    async fn load(&self) -> DomainResult<StoredImage> {
        if self.fail_load.swap(false, Ordering::SeqCst) {
            return Err(DomainError::StoreUnavailable("injected load failure".into()));
        }
        Ok(self.image())
    }

    async fn apply(&self, changes: &ChangeSet) -> DomainResult<()> {
        if self
            .failing_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DomainError::CommitFailed("injected write failure".into()));
        }

        // Build the whole next state before touching the current one
        let mut state = self.lock();
        let mut image = state.image.clone();
        let mut events = state.events.clone();

        if let Some(tallies) = &changes.tallies {
            image.tallies = tallies.iter().map(encode_current).collect::<DomainResult<_>>()?;
        }
        for version in &changes.new_versions {
            if !image.versions.iter().any(|v| v.version_number == version.version_number) {
                image.versions.push(version.clone());
            }
        }
        events.retain(|e| !changes.purged.contains(&e.tally_id));
        events.extend(changes.new_events.iter().cloned());

        state.image = image;
        state.events = events;
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(&self, image: &StoredImage) -> DomainResult<()> {
        if self.fail_replace.swap(false, Ordering::SeqCst) {
            return Err(DomainError::CommitFailed("injected replace failure".into()));
        }

        let live: HashSet<String> = image
            .tallies
            .iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        let mut state = self.lock();
        state.events.retain(|e| live.contains(&e.tally_id.to_string()));
        state.image = image.clone();
        Ok(())
    }

    async fn events_for(&self, id: TallyId) -> DomainResult<Vec<TallyEvent>> {
        let state = self.lock();
        let mut events: Vec<TallyEvent> = state
            .events
            .iter()
            .filter(|e| e.tally_id == id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse for newest first
        events.sort_by_key(|e| e.timestamp);
        events.reverse();
        Ok(events)
    }
}
