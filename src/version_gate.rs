//! Version Gate
//!
//! Per-version first-run records, and the decision whether a launch must
//! migrate before anything else touches the store.

use crate::domain::{AppVersion, DomainResult, VersionRecord};
use crate::repository::EntityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    running: AppVersion,
}

impl VersionGate {
    pub fn new(running: AppVersion) -> Self {
        Self { running }
    }

    pub fn running(&self) -> AppVersion {
        self.running
    }

    /// True when `running` is newer than the last recorded version. No record
    /// at all (first install, or a store from before version tracking) and an
    /// unparsable record both count as older.
    pub fn should_migrate(stored: Option<&VersionRecord>, running: AppVersion) -> bool {
        match stored.and_then(VersionRecord::parsed) {
            Some(stored) => running > stored,
            None => true,
        }
    }

    pub fn check(&self, stored: Option<&VersionRecord>) -> bool {
        Self::should_migrate(stored, self.running)
    }

    /// Insert and commit this version's record unless it already exists.
    /// Returns whether this was the version's first run.
    pub async fn record_first_run(&self, store: &EntityStore) -> DomainResult<bool> {
        let inserted = store.insert_version_if_absent(&self.running).await;
        if inserted {
            store.commit().await?;
            log::info!("First run of version {}", self.running);
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryMedium, MigrationPolicy};
    use chrono::Utc;
    use std::sync::Arc;

    fn record(version: &str) -> VersionRecord {
        VersionRecord {
            version_number: version.to_string(),
            date_first_opened: Utc::now(),
        }
    }

    #[test]
    fn test_should_migrate() {
        let running = AppVersion::new(2, 1, 0);
        assert!(VersionGate::should_migrate(None, running));
        assert!(VersionGate::should_migrate(Some(&record("2.0.9")), running));
        assert!(VersionGate::should_migrate(Some(&record("not-a-version")), running));
        assert!(!VersionGate::should_migrate(Some(&record("2.1")), running));
        assert!(!VersionGate::should_migrate(Some(&record("3.0.0")), running));
    }

    #[tokio::test]
    async fn test_record_first_run_is_idempotent() {
        let medium = Arc::new(MemoryMedium::new());
        let (store, _) = EntityStore::open(medium.clone(), MigrationPolicy::default())
            .await
            .unwrap();
        let gate = VersionGate::new(AppVersion::new(1, 4, 2));

        assert!(gate.record_first_run(&store).await.unwrap());
        assert!(!gate.record_first_run(&store).await.unwrap());

        assert_eq!(medium.image().versions.len(), 1);
        assert!(!gate.check(store.latest_version().await.as_ref()));
        assert_eq!(medium.apply_count(), 1);
    }
}
