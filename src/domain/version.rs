//! App Version Entity
//!
//! One record per app version that has run against the store; used as the
//! migration gate and never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dotted numeric app version (`major.minor.patch`); missing parts are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `"2"`, `"2.1"` or `"2.1.3"`. A build suffix (`"2.1.3-beta"`,
    /// `"2.1.3+45"`) is ignored. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let core = s.trim().split(['-', '+']).next()?;
        if core.is_empty() {
            return None;
        }
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in core.split('.') {
            if count == 3 {
                return None;
            }
            parts[count] = piece.parse().ok()?;
            count += 1;
        }
        Some(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl std::fmt::Display for AppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version_number: String,
    pub date_first_opened: DateTime<Utc>,
}

impl VersionRecord {
    pub fn new(version: &AppVersion, date_first_opened: DateTime<Utc>) -> Self {
        Self {
            version_number: version.to_string(),
            date_first_opened,
        }
    }

    pub fn parsed(&self) -> Option<AppVersion> {
        AppVersion::parse(&self.version_number)
    }

    /// Highest stored version. Unparsable entries sort below every real one.
    pub fn latest(records: &[VersionRecord]) -> Option<&VersionRecord> {
        records.iter().max_by_key(|r| r.parsed())
    }
}
