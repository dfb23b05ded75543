/*
    errors.rs - Error types for the CRDT model layer

    Stale operations are rejected with a boolean `false` and never raise an
    error; the variants here cover invariant violations that indicate data
    corruption or programmer error.
*/

use thiserror::Error;

/// Errors that can occur in the CRDT model layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// A version map was asked to move an actor's clock backwards
    #[error("invalid version for actor {actor}: {attempted} is behind current {current}")]
    InvalidVersion {
        actor: String,
        current: u64,
        attempted: u64,
    },

    /// A merge implied that an actor's contribution decreased
    #[error("apparent decrement for actor {actor}: {from} -> {to}")]
    ApparentDecrement { actor: String, from: u64, to: u64 },

    /// Two replicas disagree on state they both claim to have observed
    #[error("divergent CRDT state: {0}")]
    Divergence(String),

    /// Entity-level identity or timestamps differ between merge inputs
    #[error("immutable metadata mismatch: {0}")]
    MetadataMismatch(String),
}

/// Result type for CRDT operations
pub type CrdtResult<T> = Result<T, CrdtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CrdtError::ApparentDecrement {
            actor: "alice".to_string(),
            from: 7,
            to: 3,
        };
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("7 -> 3"));
    }

    #[test]
    fn test_invalid_version_display() {
        let err = CrdtError::InvalidVersion {
            actor: "bob".to_string(),
            current: 4,
            attempted: 2,
        };
        assert!(err.to_string().contains("2 is behind current 4"));
    }
}
