//! Domain Layer - Errors

use thiserror::Error;

use super::tally::TallyId;

/// Common result type for domain operations
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level errors
///
/// `MigrationFailed` is only ever returned when the caller chose to abort;
/// the rebuild path reports through `MigrationOutcome::RebuiltEmpty` instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Record not found: {0}")]
    RecordNotFound(TallyId),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Migration from schema v{from} to v{to} failed: {reason}")]
    MigrationFailed { from: u32, to: u32, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DomainError {
    /// Errors a caller can recover from locally without user involvement.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DomainError::RecordNotFound(_) | DomainError::CommitFailed(_) | DomainError::InvalidInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DomainError::MigrationFailed {
            from: 1,
            to: 3,
            reason: "bad counter".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration from schema v1 to v3 failed: bad counter"
        );
        assert!(!err.is_recoverable());
        assert!(DomainError::CommitFailed("disk full".into()).is_recoverable());
    }
}
