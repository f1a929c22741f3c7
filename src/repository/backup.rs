//! JSON backup export and restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::migrations::{decode_current, encode_current, migrate_image, CURRENT_SCHEMA_VERSION};
use super::store::EntityStore;
use super::traits::{RawRecord, StoredImage};
use crate::domain::{DomainError, DomainResult, TallyRecord, VersionRecord};

pub const BACKUP_FORMAT: &str = "trivit-backup";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub format: String,
    pub exported_at: DateTime<Utc>,
    /// Schema the tally payloads are written in
    pub schema_version: u32,
    pub tallies: Vec<RawRecord>,
    #[serde(default)]
    pub versions: Vec<VersionRecord>,
}

impl Backup {
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| DomainError::InvalidInput(e.to_string()))
    }

    pub fn from_json(json: &str) -> DomainResult<Self> {
        let backup: Backup =
            serde_json::from_str(json).map_err(|e| DomainError::InvalidInput(format!("bad backup: {}", e)))?;
        if backup.format != BACKUP_FORMAT {
            return Err(DomainError::InvalidInput(format!(
                "unknown backup format '{}'",
                backup.format
            )));
        }
        Ok(backup)
    }

    /// Decode the payloads, upgrading them first if they were exported by an
    /// older schema.
    fn into_records(self) -> DomainResult<(Vec<TallyRecord>, Vec<VersionRecord>)> {
        if self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(DomainError::InvalidInput(format!(
                "backup schema v{} is newer than supported v{}",
                self.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        let image = migrate_image(
            StoredImage {
                schema_version: self.schema_version,
                tallies: self.tallies,
                versions: self.versions,
            },
            CURRENT_SCHEMA_VERSION,
        )
        .map_err(|e| DomainError::InvalidInput(format!("backup cannot be upgraded: {}", e)))?;

        let records = image
            .tallies
            .iter()
            .map(|raw| decode_current(raw).map_err(|e| DomainError::InvalidInput(e.to_string())))
            .collect::<DomainResult<Vec<_>>>()?;

        let mut seen = HashSet::new();
        if let Some(dup) = records.iter().find(|r| !seen.insert(r.id)) {
            return Err(DomainError::InvalidInput(format!("backup repeats tally id {}", dup.id)));
        }
        Ok((records, image.versions))
    }
}

impl EntityStore {
    /// Committed tallies and version records as a backup document. The
    /// trash is not exported.
    pub async fn export_backup(&self) -> DomainResult<Backup> {
        let committed = self.committed().await;
        let tallies = committed
            .tallies
            .iter()
            .map(encode_current)
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(Backup {
            format: BACKUP_FORMAT.to_string(),
            exported_at: Utc::now(),
            schema_version: committed.schema_version,
            tallies,
            versions: committed.versions.clone(),
        })
    }

    /// Stage the backup's tallies in place of the current ones.
    ///
    /// Version records are merged, never removed. A restored tally leaves
    /// the trash if it was there; the rest of the trash stays. Nothing is
    /// durable until `commit`; `discard` undoes the restore. Returns the
    /// restored count.
    pub async fn restore_backup(&self, backup: Backup) -> DomainResult<usize> {
        let (mut records, versions) = backup.into_records()?;
        for record in &mut records {
            record.deleted_at = None;
        }

        let mut pending = self.writer.lock().await;
        let committed = self.committed().await;

        let old_ids: Vec<_> = pending.working_copy(&committed).tallies.iter().map(|t| t.id).collect();
        let restored: HashSet<_> = records.iter().map(|r| r.id).collect();

        let mut added_versions = Vec::new();
        let arena = pending.working_copy(&committed);
        for version in versions {
            if !arena.versions.iter().any(|v| v.version_number == version.version_number) {
                arena.versions.push(version.clone());
                added_versions.push(version);
            }
        }
        let count = records.len();
        arena.tallies = records;
        arena.trashed.retain(|t| !restored.contains(&t.id));

        // History of tallies that did not survive the restore goes with them
        let gone: Vec<_> = old_ids.into_iter().filter(|id| !restored.contains(id)).collect();
        pending.new_events.retain(|e| !gone.contains(&e.tally_id));
        pending.purged.extend(gone);
        pending.new_versions.extend(added_versions);
        pending.tallies_dirty = true;

        log::info!("Staged restore of {} tallies from backup", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Mutation;
    use crate::repository::{MemoryMedium, MigrationPolicy};
    use serde_json::json;
    use std::sync::Arc;

    async fn store_with(titles: &[&str]) -> EntityStore {
        let (store, _) = EntityStore::open(Arc::new(MemoryMedium::new()), MigrationPolicy::default())
            .await
            .unwrap();
        for title in titles {
            store.create(*title, 0).await.unwrap();
        }
        store.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_export_then_restore_into_other_store() {
        let source = store_with(&["Coffee", "Tea"]).await;
        let tea = source.fetch_all().await[1].id;
        source.mutate(tea, Mutation::AdjustBy { by: 4 }).await.unwrap();
        source.commit().await.unwrap();

        let json = source.export_backup().await.unwrap().to_json().unwrap();

        let target = store_with(&["Old"]).await;
        let restored = target.restore_backup(Backup::from_json(&json).unwrap()).await.unwrap();
        assert_eq!(restored, 2);

        // Staged only
        assert_eq!(target.fetch_all().await[0].title, "Old");
        target.commit().await.unwrap();

        let records = target.fetch_all().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].title, "Tea");
        assert_eq!(records[1].counter, 4);
        assert_eq!(records[1].id, tea);
    }

    #[tokio::test]
    async fn test_restore_upgrades_legacy_backup() {
        let json = json!({
            "format": BACKUP_FORMAT,
            "exportedAt": "2020-01-01T00:00:00Z",
            "schemaVersion": 1,
            "tallies": [{"title": "Push-ups", "counter": 12, "color": 3, "isCollapsed": 0}]
        })
        .to_string();

        let store = store_with(&[]).await;
        store.restore_backup(Backup::from_json(&json).unwrap()).await.unwrap();
        store.commit().await.unwrap();

        let records = store.fetch_all().await;
        assert_eq!(records[0].title, "Push-ups");
        assert_eq!(records[0].counter, 12);
        assert_eq!(records[0].color_index, 3);
    }

    #[tokio::test]
    async fn test_discard_undoes_restore() {
        let store = store_with(&["Keep"]).await;
        let backup = store_with(&["Other"]).await.export_backup().await.unwrap();

        store.restore_backup(backup).await.unwrap();
        store.discard().await;
        store.commit().await.unwrap();

        assert_eq!(store.fetch_all().await[0].title, "Keep");
    }

    #[test]
    fn test_rejects_foreign_document() {
        let json = json!({"format": "something-else", "exportedAt": "2020-01-01T00:00:00Z", "schemaVersion": 3, "tallies": []});
        assert!(matches!(
            Backup::from_json(&json.to_string()),
            Err(DomainError::InvalidInput(_))
        ));
        assert!(Backup::from_json("not json").is_err());
    }
}
