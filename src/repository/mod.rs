//! Repository Layer
//!
//! Persistence media, schema migrations and the entity store.

mod backup;
mod db;
mod memory;
mod migrations;
mod store;
mod traits;


pub use backup::{Backup, BACKUP_FORMAT};
pub use db::SqliteMedium;
pub use memory::MemoryMedium;
pub use migrations::{migrate_image, steps_between, MigrationStep, CURRENT_SCHEMA_VERSION, LEGACY_SCHEMA_VERSION};
pub use store::{CommitSummary, EntityStore, MigrationOutcome, MigrationPolicy, StoreAcquisition, TRASH_RETENTION_DAYS};
pub use traits::{ChangeSet, RawRecord, StorageMedium, StoredImage};
