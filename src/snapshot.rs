//! Detached, comparison-safe copies of the tally state.

use serde::{Deserialize, Serialize};

use crate::domain::{TallyId, TallyRecord};
use crate::repository::EntityStore;

/// Comparison-relevant fields of one tally, copied by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyValue {
    pub id: TallyId,
    pub title: String,
    pub counter: i64,
    pub color_index: i32,
    pub is_collapsed: bool,
}

impl From<&TallyRecord> for TallyValue {
    fn from(record: &TallyRecord) -> Self {
        Self {
            id: record.id,
            title: record.title.clone(),
            counter: record.counter,
            color_index: record.color_index,
            is_collapsed: record.is_collapsed,
        }
    }
}

/// Ordered tally values taken at one instant. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: Vec<TallyValue>,
}

impl Snapshot {
    pub fn new(entries: Vec<TallyValue>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[TallyValue] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: TallyId) -> Option<&TallyValue> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.title.as_str())
    }

    pub fn into_entries(self) -> Vec<TallyValue> {
        self.entries
    }
}

pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Copy the committed state. Holds the store's read lock for the copy, so
    /// a concurrent commit lands entirely before or entirely after it.
    pub async fn capture(store: &EntityStore) -> Snapshot {
        store.with_committed(Self::from_records).await
    }

    pub fn from_records(records: &[TallyRecord]) -> Snapshot {
        Snapshot::new(records.iter().map(TallyValue::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Mutation;
    use crate::repository::{MemoryMedium, MigrationPolicy};
    use std::sync::Arc;

    async fn setup_store() -> Arc<EntityStore> {
        let (store, _) = EntityStore::open(Arc::new(MemoryMedium::new()), MigrationPolicy::default())
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_capture_is_detached_from_store() {
        let store = setup_store().await;
        let coffee = store.create("Coffee", 1).await.unwrap();
        store.commit().await.unwrap();

        let before = SnapshotBuilder::capture(&store).await;
        store.mutate(coffee.id, Mutation::Increment).await.unwrap();
        store.mutate(coffee.id, Mutation::Rename { title: "Espresso".into() }).await.unwrap();
        store.commit().await.unwrap();

        assert_eq!(before.entries()[0].title, "Coffee");
        assert_eq!(before.entries()[0].counter, 0);

        let after = SnapshotBuilder::capture(&store).await;
        assert_eq!(after.get(coffee.id).unwrap().title, "Espresso");
        assert_eq!(after.get(coffee.id).unwrap().counter, 1);
    }

    #[tokio::test]
    async fn test_capture_never_sees_torn_commit() {
        let store = setup_store().await;
        let a = store.create("A", 0).await.unwrap();
        let b = store.create("B", 0).await.unwrap();
        store.commit().await.unwrap();

        // Every commit bumps both counters; a capture must always see them equal
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    store.mutate(a.id, Mutation::Increment).await.unwrap();
                    tokio::task::yield_now().await;
                    store.mutate(b.id, Mutation::Increment).await.unwrap();
                    store.commit().await.unwrap();
                }
            })
        };

        for _ in 0..50 {
            let snapshot = SnapshotBuilder::capture(&store).await;
            assert_eq!(snapshot.entries()[0].counter, snapshot.entries()[1].counter);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        let last = SnapshotBuilder::capture(&store).await;
        assert_eq!(last.entries()[0].counter, 50);
    }
}
