//! Schema Migrations
//!
//! Ordered version-to-version upgrade steps. Each step is a pure transform
//! over the whole record set; the store persists the result in one atomic
//! `replace`, so a failing step never touches the old store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use super::traits::{RawRecord, StoredImage};
use crate::domain::{DomainError, DomainResult, TallyRecord, TallyType};

/// Schema version the code reads and writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Stores that predate version tracking are treated as this version.
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

type StepFn = fn(Vec<RawRecord>) -> Result<Vec<RawRecord>, String>;

pub struct MigrationStep {
    /// Upgrades `from` to `from + 1`
    pub from: u32,
    pub name: &'static str,
    apply: StepFn,
}

static STEPS: [MigrationStep; 2] = [
    MigrationStep {
        from: 1,
        name: "assign_stable_ids",
        apply: assign_stable_ids,
    },
    MigrationStep {
        from: 2,
        name: "normalize_type_and_counter",
        apply: normalize_type_and_counter,
    },
];

/// Steps needed to go from `from` to `to`, in order.
pub fn steps_between(from: u32, to: u32) -> Result<Vec<&'static MigrationStep>, String> {
    let mut steps = Vec::new();
    let mut version = from;
    while version < to {
        let step = STEPS
            .iter()
            .find(|s| s.from == version)
            .ok_or_else(|| format!("no migration step from schema v{}", version))?;
        steps.push(step);
        version += 1;
    }
    Ok(steps)
}

/// Bring an image up to `target`. A no-op when it is already there.
pub fn migrate_image(mut image: StoredImage, target: u32) -> DomainResult<StoredImage> {
    let from = image.schema_version;
    if from >= target {
        return Ok(image);
    }
    let fail = |reason: String| DomainError::MigrationFailed {
        from,
        to: target,
        reason,
    };
    if target > CURRENT_SCHEMA_VERSION {
        return Err(fail(format!(
            "target schema v{} is newer than supported v{}",
            target, CURRENT_SCHEMA_VERSION
        )));
    }

    for step in steps_between(from, target).map_err(fail)? {
        log::info!(
            "Migrating {} tallies: v{} -> v{} ({})",
            image.tallies.len(),
            step.from,
            step.from + 1,
            step.name
        );
        image.tallies = (step.apply)(image.tallies)
            .map_err(|reason| fail(format!("{}: {}", step.name, reason)))?;
        image.schema_version = step.from + 1;
    }
    Ok(image)
}

/// v1 -> v2: stable ids, `color` renamed to `colorIndex`, RFC 3339 timestamps,
/// numeric booleans.
fn assign_stable_ids(records: Vec<RawRecord>) -> Result<Vec<RawRecord>, String> {
    records
        .into_iter()
        .enumerate()
        .map(|(position, mut record)| {
            let has_id = record
                .get("id")
                .and_then(Value::as_str)
                .map(|s| Uuid::parse_str(s).is_ok())
                .unwrap_or(false);
            if !has_id {
                record.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }

            let color = record.remove("color");
            if !record.contains_key("colorIndex") {
                record.insert("colorIndex".into(), color.unwrap_or(Value::from(0)));
            }

            let created_at = match record.remove("createdAt") {
                None | Some(Value::Null) => DateTime::UNIX_EPOCH,
                Some(Value::Number(n)) => {
                    let secs = n
                        .as_f64()
                        .ok_or_else(|| format!("record {}: createdAt out of range", position))?;
                    DateTime::from_timestamp_millis((secs * 1000.0) as i64)
                        .ok_or_else(|| format!("record {}: createdAt out of range", position))?
                }
                Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| format!("record {}: bad createdAt: {}", position, e))?,
                Some(other) => {
                    return Err(format!("record {}: bad createdAt {}", position, other));
                }
            };
            record.insert(
                "createdAt".into(),
                Value::String(created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );

            let collapsed = match record.get("isCollapsed") {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
                _ => false,
            };
            record.insert("isCollapsed".into(), Value::Bool(collapsed));

            Ok(record)
        })
        .collect()
}

/// v2 -> v3: closed `type` tag, counters floored at 0, non-null titles,
/// unique ids.
fn normalize_type_and_counter(records: Vec<RawRecord>) -> Result<Vec<RawRecord>, String> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .enumerate()
        .map(|(position, mut record)| {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("record {}: missing id", position))?
                .to_string();
            if !seen.insert(id.clone()) {
                return Err(format!("record {}: duplicate id {}", position, id));
            }

            let tally_type = match record.get("type") {
                Some(Value::String(s)) => TallyType::from_tag(s),
                _ => TallyType::Tally,
            };
            record.insert("type".into(), Value::String(tally_type.as_str().into()));

            let counter = match record.get("counter") {
                None | Some(Value::Null) => 0,
                Some(Value::Number(n)) => match n.as_i64() {
                    Some(v) => v,
                    None => n
                        .as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                        .ok_or_else(|| format!("record {}: counter {} is not an integer", position, n))?,
                },
                Some(other) => {
                    return Err(format!("record {}: counter {} is not a number", position, other));
                }
            };
            record.insert("counter".into(), Value::from(counter.max(0)));

            match record.get("title") {
                None | Some(Value::Null) => {
                    record.insert("title".into(), Value::String(String::new()));
                }
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(format!("record {}: title {} is not text", position, other));
                }
            }

            Ok(record)
        })
        .collect()
}

/// Encode a record in the current schema layout.
pub fn encode_current(record: &TallyRecord) -> DomainResult<RawRecord> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DomainError::CommitFailed(format!(
            "tally {} encoded as non-object {}",
            record.id, other
        ))),
        Err(e) => Err(DomainError::CommitFailed(e.to_string())),
    }
}

/// Decode a record stored in the current schema layout.
pub fn decode_current(raw: &RawRecord) -> DomainResult<TallyRecord> {
    let record: TallyRecord = serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|e| DomainError::StoreUnavailable(format!("corrupt tally record: {}", e)))?;
    if record.counter < 0 {
        return Err(DomainError::StoreUnavailable(format!(
            "tally {} has negative counter {}",
            record.id, record.counter
        )));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn legacy_image(records: Vec<Value>) -> StoredImage {
        StoredImage {
            schema_version: LEGACY_SCHEMA_VERSION,
            tallies: records.into_iter().map(raw).collect(),
            versions: Vec::new(),
        }
    }

    #[test]
    fn test_legacy_records_reach_current_schema() {
        let image = legacy_image(vec![
            json!({"title": "Coffee", "counter": 3, "color": 4, "isCollapsed": 1, "type": "western", "createdAt": 1420070400.0}),
            json!({"title": null, "counter": -2, "color": 1, "isCollapsed": 0, "type": "counter"}),
        ]);

        let migrated = migrate_image(image, CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(migrated.schema_version, CURRENT_SCHEMA_VERSION);

        let records: Vec<TallyRecord> = migrated.tallies.iter().map(|r| decode_current(r).unwrap()).collect();
        assert_eq!(records[0].title, "Coffee");
        assert_eq!(records[0].counter, 3);
        assert_eq!(records[0].color_index, 4);
        assert!(records[0].is_collapsed);
        assert_eq!(records[0].tally_type, TallyType::Tally);
        assert_eq!(records[0].created_at.timestamp(), 1420070400);

        assert_eq!(records[1].title, "");
        assert_eq!(records[1].counter, 0);
        assert_eq!(records[1].tally_type, TallyType::Counter);
        assert_ne!(records[0].id, records[1].id);
    }

    #[test]
    fn test_migrating_current_image_is_noop() {
        let image = legacy_image(vec![json!({"title": "A", "counter": 1})]);
        let once = migrate_image(image, CURRENT_SCHEMA_VERSION).unwrap();
        let twice = migrate_image(once.clone(), CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_bad_counter_fails_with_context() {
        let image = legacy_image(vec![json!({"title": "A", "counter": "lots"})]);
        match migrate_image(image, CURRENT_SCHEMA_VERSION) {
            Err(DomainError::MigrationFailed { from, to, reason }) => {
                assert_eq!(from, 1);
                assert_eq!(to, CURRENT_SCHEMA_VERSION);
                assert!(reason.contains("normalize_type_and_counter"));
            }
            other => panic!("expected MigrationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let id = Uuid::new_v4().to_string();
        let image = StoredImage {
            schema_version: 2,
            tallies: vec![
                raw(json!({"id": id, "title": "A", "counter": 0, "colorIndex": 0, "isCollapsed": false, "createdAt": "2024-01-01T00:00:00Z"})),
                raw(json!({"id": id, "title": "B", "counter": 0, "colorIndex": 0, "isCollapsed": false, "createdAt": "2024-01-01T00:00:00Z"})),
            ],
            versions: Vec::new(),
        };
        assert!(matches!(
            migrate_image(image, CURRENT_SCHEMA_VERSION),
            Err(DomainError::MigrationFailed { from: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_target_has_no_path() {
        assert!(steps_between(1, 3).is_ok());
        assert!(steps_between(0, 3).is_err());
        let image = legacy_image(vec![]);
        assert!(matches!(
            migrate_image(image, CURRENT_SCHEMA_VERSION + 1),
            Err(DomainError::MigrationFailed { .. })
        ));
    }
}
