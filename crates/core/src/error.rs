//! Errors raised while deciding catalog commands.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Why a catalog command was refused. Always deterministic: replaying the same
/// command against the same state fails the same way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. negative price).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The aggregate does not exist, or was deleted.
    #[error("aggregate {id} not found")]
    NotFound { id: i64 },

    /// Stale version or duplicate creation.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(id: impl Into<i64>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Whether the caller could succeed by re-reading state and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_aggregate() {
        let err = DomainError::not_found(42);
        assert_eq!(err, DomainError::NotFound { id: 42 });
        assert_eq!(err.to_string(), "aggregate 42 not found");
        assert!(!err.is_conflict());
    }

    #[test]
    fn conflict_is_flagged() {
        assert!(DomainError::conflict("stale").is_conflict());
        assert!(!DomainError::validation("bad price").is_conflict());
    }
}
