//! Process startup: logging, config, and the gated store acquisition that
//! must finish before any other core operation.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::diff::PlanLimits;
use crate::domain::{AppVersion, DomainResult};
use crate::repository::{
    EntityStore, MigrationOutcome, MigrationPolicy, SqliteMedium, StorageMedium, CURRENT_SCHEMA_VERSION,
};
use crate::sync::{PrimarySync, SyncChannel, SyncError, Transport};
use crate::version_gate::VersionGate;

pub const LOG_NAME: &str = "trivit";

/// An opened store and what it took to open it.
pub struct Startup {
    pub store: Arc<EntityStore>,
    pub migration: MigrationOutcome,
    /// First launch of the running version against this store
    pub first_run: bool,
}

/// Wire the rolling file logger under `log_dir`.
pub fn init_logging(log_dir: &Path) -> Result<(), rolling_logger::LoggerError> {
    rolling_logger::init_logger(log_dir, LOG_NAME)
}

/// Acquire the store, migrate if the gate or the schema says so, open it and
/// record the running version.
///
/// Nothing else can reach the store until this returns: the acquisition is
/// only turned into an `EntityStore` after migration finished or fell back.
pub async fn bootstrap(
    medium: Arc<dyn StorageMedium>,
    running: AppVersion,
    policy: MigrationPolicy,
) -> DomainResult<Startup> {
    let gate = VersionGate::new(running);
    let mut acquisition = EntityStore::acquire(medium).await?;

    let version_newer = gate.check(acquisition.latest_version());
    let migration = if version_newer || acquisition.needs_migration() {
        log::info!(
            "Running {} against schema v{}, migrating to v{}",
            running,
            acquisition.schema_version(),
            CURRENT_SCHEMA_VERSION
        );
        acquisition.migrate(CURRENT_SCHEMA_VERSION, policy).await?
    } else {
        MigrationOutcome::UpToDate
    };

    let (store, _) = acquisition.into_store()?;
    let first_run = gate.record_first_run(&store).await?;
    if store.purge_expired_trash(Utc::now()).await > 0 {
        store.commit().await?;
    }

    if migration.lost_data() {
        log::warn!("Store was rebuilt empty during startup");
    }
    Ok(Startup {
        store: Arc::new(store),
        migration,
        first_run,
    })
}

/// Load (or create) the config in `dir` and bootstrap its SQLite store.
pub async fn open_in_dir(dir: &Path, running: AppVersion) -> DomainResult<(CoreConfig, Startup)> {
    let config = CoreConfig::load_or_default(dir)?;
    if !CoreConfig::config_path(dir).exists() {
        // Keeps the generated device id stable across launches
        config.save(dir)?;
    }

    let medium = SqliteMedium::open(&config.database_path(dir))?;
    let startup = bootstrap(Arc::new(medium), running, config.migration_policy).await?;
    Ok((config, startup))
}

/// Running primary-side sync: the channel actor plus the loop that applies
/// companion edits and publishes local ones.
pub struct SyncService {
    channel: Arc<SyncChannel>,
    changes: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl SyncService {
    /// The channel, for feeding it transport bytes and link events.
    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    /// Call after committing a local change the companion should see.
    pub fn notify_local_change(&self) -> Result<(), SyncError> {
        self.changes.send(()).map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn shutdown(self) {
        self.channel.close();
        if let Err(e) = self.task.await {
            log::error!("Primary sync task failed: {}", e);
        }
    }
}

pub fn start_primary_sync(
    store: Arc<EntityStore>,
    config: &CoreConfig,
    transport: Arc<dyn Transport>,
) -> Result<SyncService, SyncError> {
    let channel = Arc::new(SyncChannel::spawn(
        config.device_id.clone(),
        config.sync.clone(),
        transport,
    ));
    let inbound = channel.subscribe()?;
    let (changes, local_changes) = mpsc::unbounded_channel();

    let primary = PrimarySync::new(store, channel.clone(), PlanLimits::from(&config.sync));
    let task = tokio::spawn(primary.run(inbound, channel.watch_status(), local_changes));
    log::info!("Primary sync started as {}", config.device_id);

    Ok(SyncService {
        channel,
        changes,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainError;
    use crate::repository::{MemoryMedium, StoredImage, LEGACY_SCHEMA_VERSION};
    use serde_json::json;

    fn legacy(records: Vec<serde_json::Value>) -> Arc<MemoryMedium> {
        Arc::new(MemoryMedium::with_image(StoredImage {
            schema_version: LEGACY_SCHEMA_VERSION,
            tallies: records.into_iter().filter_map(|v| v.as_object().cloned()).collect(),
            versions: Vec::new(),
        }))
    }

    #[tokio::test]
    async fn test_fresh_install() {
        let startup = bootstrap(
            Arc::new(MemoryMedium::new()),
            AppVersion::new(1, 0, 0),
            MigrationPolicy::default(),
        )
        .await
        .unwrap();
        assert!(startup.first_run);
        assert_eq!(startup.migration, MigrationOutcome::UpToDate);
        assert_eq!(startup.store.versions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_migrates_once() {
        let medium = legacy(vec![json!({"title": "Coffee", "counter": 3})]);

        let first = bootstrap(medium.clone(), AppVersion::new(2, 0, 0), MigrationPolicy::default())
            .await
            .unwrap();
        assert!(matches!(first.migration, MigrationOutcome::Migrated { from: 1, .. }));
        assert!(first.first_run);
        assert_eq!(first.store.fetch_all().await[0].counter, 3);
        drop(first);

        let second = bootstrap(medium.clone(), AppVersion::new(2, 0, 0), MigrationPolicy::default())
            .await
            .unwrap();
        assert_eq!(second.migration, MigrationOutcome::UpToDate);
        assert!(!second.first_run);
        assert_eq!(medium.image().versions.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_policy_surfaces_migration_failed() {
        let medium = legacy(vec![json!({"title": "Bad", "counter": {"n": 1}})]);
        let result = bootstrap(medium.clone(), AppVersion::new(2, 0, 0), MigrationPolicy::AbortPreservingStore).await;
        assert!(matches!(result, Err(DomainError::MigrationFailed { .. })));
        assert_eq!(medium.image().schema_version, LEGACY_SCHEMA_VERSION);
        assert!(medium.image().versions.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_policy_reports_data_loss() {
        let medium = legacy(vec![json!({"title": "Bad", "counter": {"n": 1}})]);
        let startup = bootstrap(medium, AppVersion::new(2, 0, 0), MigrationPolicy::RebuildEmpty)
            .await
            .unwrap();
        assert!(startup.migration.lost_data());
        assert!(startup.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_in_dir_persists_config() {
        let dir = tempfile::tempdir().unwrap();
        let (config, startup) = open_in_dir(dir.path(), AppVersion::new(1, 2, 0)).await.unwrap();
        assert!(startup.first_run);
        drop(startup);

        let (again, startup) = open_in_dir(dir.path(), AppVersion::new(1, 2, 0)).await.unwrap();
        assert_eq!(again.device_id, config.device_id);
        assert!(!startup.first_run);
        assert!(config.database_path(dir.path()).exists());
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: std::sync::Mutex<Vec<crate::sync::Envelope>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn transmit(&self, bytes: Vec<u8>) -> Result<(), SyncError> {
            self.sent.lock().unwrap().push(crate::sync::Envelope::decode(&bytes)?);
            Ok(())
        }
    }

    impl RecordingTransport {
        async fn wait_for(&self, count: usize) -> Vec<crate::sync::Envelope> {
            for _ in 0..200 {
                let sent = self.sent.lock().unwrap().clone();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("transport never saw {} messages", count);
        }
    }

    #[tokio::test]
    async fn test_sync_service_publishes_on_link_and_change() {
        use crate::domain::Mutation;
        use crate::sync::{DeltaOp, LinkEvent, SyncMessage};

        let startup = bootstrap(
            Arc::new(MemoryMedium::new()),
            AppVersion::new(1, 0, 0),
            MigrationPolicy::default(),
        )
        .await
        .unwrap();
        let store = startup.store.clone();
        let coffee = store.create("Coffee", 0).await.unwrap();
        store.commit().await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let service = start_primary_sync(store.clone(), &CoreConfig::default(), transport.clone()).unwrap();
        service.channel().link(LinkEvent::Available).unwrap();
        service.channel().link(LinkEvent::HandshakeComplete).unwrap();

        let sent = transport.wait_for(1).await;
        assert!(sent[0].message.is_full_snapshot());

        store.mutate(coffee.id, Mutation::Increment).await.unwrap();
        store.commit().await.unwrap();
        service.notify_local_change().unwrap();

        let sent = transport.wait_for(2).await;
        assert_eq!(
            sent[1].message,
            SyncMessage::Delta(vec![DeltaOp::AdjustBy { id: coffee.id, by: 1 }])
        );
        assert_eq!(sent[1].seq, sent[0].seq + 1);
        service.shutdown().await;
    }
}
