//! Trivit Core
//!
//! Durable tally store and companion-device sync.
//!
//! Layered architecture:
//! - domain: Tally and version entities, errors
//! - repository: Storage media, schema migrations, the entity store
//! - snapshot / diff: Detached copies of state and how two of them differ
//! - sync: Wire messages, the reachability-aware channel, primary and companion roles
//! - version_gate / startup: What must happen before anything else touches the store

pub mod config;
pub mod diff;
pub mod domain;
pub mod repository;
pub mod snapshot;
pub mod startup;
pub mod sync;
pub mod version_gate;

pub use config::{CoreConfig, SyncSettings};
pub use diff::{ChangeKind, DiffEngine, DiffResult, OriginHint, PlanLimits, SyncPlan};
pub use domain::{
    AppVersion, DomainError, DomainResult, Mutation, TallyEvent, TallyId, TallyRecord, TallyStats, TallyType,
    VersionRecord,
};
pub use repository::{EntityStore, MigrationOutcome, MigrationPolicy, SqliteMedium, StorageMedium};
pub use snapshot::{Snapshot, SnapshotBuilder, TallyValue};
pub use startup::{bootstrap, init_logging, open_in_dir, start_primary_sync, Startup, SyncService};
pub use sync::{CompanionMirror, LinkEvent, LinkState, PrimarySync, SyncChannel, SyncError, SyncMessage};
pub use version_gate::VersionGate;
