//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the batch model itself
/// (validation, state-machine violations, decode failures). Storage
/// concerns (missing records, key conflicts) live in the store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. a field over its length limit).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status or state transition not permitted by the state machine.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Opaque payload bytes (checkpoint data, persisted user data) could not
    /// be decoded. Fatal for the owning step thread, never ignored.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The schema generation of a stored record could not be determined.
    /// Fatal; the read path must not guess a shape.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
