//! Database Connection and Setup
//!
//! SQLite-backed storage medium. The schema integer lives in
//! `PRAGMA user_version`; tally payloads are JSON so migrations can work on
//! them without DDL changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::migrations::{CURRENT_SCHEMA_VERSION, LEGACY_SCHEMA_VERSION};
use super::traits::{ChangeSet, RawRecord, StorageMedium, StoredImage};
use crate::domain::{DomainError, DomainResult, EventKind, TallyEvent, TallyId, VersionRecord};

/// SQLite implementation of the storage medium
pub struct SqliteMedium {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMedium {
    /// Open (or create) a database file.
    pub fn open(db_path: &Path) -> DomainResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DomainError::StoreUnavailable(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| DomainError::StoreUnavailable(format!("Failed to open db: {}", e)))?;
        Self::init_with_connection(conn)
    }

    /// Create an in-memory database (for tests and previews).
    pub fn open_in_memory() -> DomainResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DomainError::StoreUnavailable(format!("Failed to open db: {}", e)))?;
        Self::init_with_connection(conn)
    }

    fn init_with_connection(conn: Connection) -> DomainResult<Self> {
        run_setup(&conn).map_err(|e| DomainError::StoreUnavailable(format!("Failed to set up db: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Check if a table exists
fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get::<_, i64>(0))
        .map(|v| v.max(0) as u32)
}

/// Create missing tables and stamp the schema version on fresh files.
fn run_setup(conn: &Connection) -> rusqlite::Result<()> {
    // Reading sqlite_master is also what rejects a file that is not a database
    let fresh = !table_exists(conn, "tallies")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tallies (
            position INTEGER NOT NULL,
            payload TEXT NOT NULL
        )",
        (),
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS versions (
            version_number TEXT PRIMARY KEY,
            date_first_opened INTEGER NOT NULL
        )",
        (),
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tally_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tally_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            delta INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        )",
        (),
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tally_events_tally ON tally_events(tally_id)",
        (),
    )?;

    let current = schema_version(conn)?;
    if fresh && current == 0 {
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION as i64)?;
    } else if current == 0 {
        // Tables without a version stamp predate version tracking
        conn.pragma_update(None, "user_version", LEGACY_SCHEMA_VERSION as i64)?;
    }
    Ok(())
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn load_image(conn: &Connection) -> DomainResult<StoredImage> {
    let unavailable = |e: rusqlite::Error| DomainError::StoreUnavailable(e.to_string());
    let schema_version = schema_version(conn).map_err(unavailable)?;

    let mut stmt = conn
        .prepare("SELECT position, payload FROM tallies ORDER BY position ASC")
        .map_err(unavailable)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(unavailable)?;

    let mut tallies = Vec::new();
    for row in rows {
        let (position, payload) = row.map_err(unavailable)?;
        match serde_json::from_str::<Value>(&payload) {
            Ok(Value::Object(map)) => tallies.push(map),
            Ok(_) | Err(_) => {
                return Err(DomainError::StoreUnavailable(format!(
                    "corrupt tally payload at position {}",
                    position
                )))
            }
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT version_number, date_first_opened FROM versions
             ORDER BY date_first_opened ASC, version_number ASC",
        )
        .map_err(unavailable)?;
    let versions = stmt
        .query_map([], |row| {
            Ok(VersionRecord {
                version_number: row.get(0)?,
                date_first_opened: millis_to_datetime(row.get(1)?),
            })
        })
        .map_err(unavailable)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(unavailable)?;

    Ok(StoredImage {
        schema_version,
        tallies,
        versions,
    })
}

fn write_raw_tallies(conn: &Connection, tallies: &[RawRecord]) -> DomainResult<()> {
    conn.execute("DELETE FROM tallies", ())
        .map_err(|e| DomainError::CommitFailed(e.to_string()))?;
    for (position, raw) in tallies.iter().enumerate() {
        let payload = serde_json::to_string(raw).map_err(|e| DomainError::CommitFailed(e.to_string()))?;
        conn.execute(
            "INSERT INTO tallies (position, payload) VALUES (?, ?)",
            params![position as i64, payload],
        )
        .map_err(|e| DomainError::CommitFailed(e.to_string()))?;
    }
    Ok(())
}

fn insert_version(conn: &Connection, version: &VersionRecord) -> DomainResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO versions (version_number, date_first_opened) VALUES (?, ?)",
        params![version.version_number, version.date_first_opened.timestamp_millis()],
    )
    .map_err(|e| DomainError::CommitFailed(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl StorageMedium for SqliteMedium {
    async fn load(&self) -> DomainResult<StoredImage> {
        let conn = self.conn.lock().await;
        load_image(&conn)
    }

    async fn apply(&self, changes: &ChangeSet) -> DomainResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| DomainError::CommitFailed(e.to_string()))?;

        if let Some(tallies) = &changes.tallies {
            let raw = tallies
                .iter()
                .map(super::migrations::encode_current)
                .collect::<DomainResult<Vec<_>>>()?;
            write_raw_tallies(&tx, &raw)?;
        }

        for version in &changes.new_versions {
            insert_version(&tx, version)?;
        }

        for id in &changes.purged {
            tx.execute(
                "DELETE FROM tally_events WHERE tally_id = ?",
                params![id.to_string()],
            )
            .map_err(|e| DomainError::CommitFailed(e.to_string()))?;
        }

        for event in &changes.new_events {
            tx.execute(
                "INSERT INTO tally_events (tally_id, kind, delta, timestamp) VALUES (?, ?, ?, ?)",
                params![
                    event.tally_id.to_string(),
                    event.kind.as_str(),
                    event.delta,
                    event.timestamp.timestamp_millis()
                ],
            )
            .map_err(|e| DomainError::CommitFailed(e.to_string()))?;
        }

        // Dropping `tx` on any early return above rolls everything back
        tx.commit().map_err(|e| DomainError::CommitFailed(e.to_string()))
    }

    async fn replace(&self, image: &StoredImage) -> DomainResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| DomainError::CommitFailed(e.to_string()))?;

        write_raw_tallies(&tx, &image.tallies)?;

        tx.execute("DELETE FROM versions", ())
            .map_err(|e| DomainError::CommitFailed(e.to_string()))?;
        for version in &image.versions {
            insert_version(&tx, version)?;
        }

        tx.execute(
            "DELETE FROM tally_events WHERE tally_id NOT IN (
                SELECT json_extract(payload, '$.id') FROM tallies
                WHERE json_extract(payload, '$.id') IS NOT NULL
            )",
            (),
        )
        .map_err(|e| DomainError::CommitFailed(e.to_string()))?;

        tx.pragma_update(None, "user_version", image.schema_version as i64)
            .map_err(|e| DomainError::CommitFailed(e.to_string()))?;

        tx.commit().map_err(|e| DomainError::CommitFailed(e.to_string()))
    }

    async fn events_for(&self, id: TallyId) -> DomainResult<Vec<TallyEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT kind, delta, timestamp FROM tally_events
                 WHERE tally_id = ? ORDER BY timestamp DESC, id DESC",
            )
            .map_err(|e| DomainError::StoreUnavailable(e.to_string()))?;

        let events = stmt
            .query_map(params![id.to_string()], |row| {
                Ok(TallyEvent {
                    tally_id: id,
                    kind: EventKind::from_tag(&row.get::<_, String>(0)?),
                    delta: row.get(1)?,
                    timestamp: millis_to_datetime(row.get(2)?),
                })
            })
            .map_err(|e| DomainError::StoreUnavailable(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DomainError::StoreUnavailable(e.to_string()))?;
        Ok(events)
    }
}
