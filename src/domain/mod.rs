//! Domain Layer
//!
//! Contains the tally entities and core abstractions.
//! This layer has NO storage or transport dependencies.

mod entity;
mod event;
mod stats;
mod tally;
mod version;

pub use entity::{DomainError, DomainResult};
pub use event::{EventKind, TallyEvent};
pub use stats::{DailyActivity, HourlyActivity, TallyStats};
pub use tally::{Mutation, TallyId, TallyRecord, TallyType};
pub use version::{AppVersion, VersionRecord};
