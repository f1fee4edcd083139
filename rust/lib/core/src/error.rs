use thiserror::Error;

use crate::object_id::ObjectId;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these, not on
// the message text.

/// Stable error code constants.
pub mod error_code {
    pub const ARGUMENT: &str = "ARGUMENT";
    pub const OBJECT_INVALID: &str = "OBJECT_INVALID";
    pub const OBJECTS_NOT_FOUND: &str = "OBJECTS_NOT_FOUND";
    pub const PERSISTENCE: &str = "PERSISTENCE";
    pub const CONCURRENCY_VIOLATION: &str = "CONCURRENCY_VIOLATION";
    pub const INVALID_OPERATION: &str = "INVALID_OPERATION";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const MAPPING: &str = "MAPPING";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const SERIALIZATION: &str = "SERIALIZATION";
}

// ── DomainError ─────────────────────────────────────────────────────

/// Unified error type of the object engine.
///
/// Each variant maps to a stable error code (see [`error_code`]). None of
/// them is retried internally; the operation that raised one is aborted and
/// previously registered state stays untouched.
#[derive(Error, Debug)]
pub enum DomainError {
    /// Invalid input to an operation or command constructor.
    #[error("{0}")]
    Argument(String),

    /// Property or relation access on a deleted, discarded or invalid object.
    #[error("{0}")]
    ObjectInvalid(String),

    /// One or more requested objects have no stored record.
    #[error("Object(s) could not be found: {}", join_ids(.0))]
    ObjectsNotFound(Vec<ObjectId>),

    /// The storage layer returned data inconsistent with the request.
    #[error("{0}")]
    Persistence(String),

    /// Commit found a stale concurrency token on at least one record.
    #[error("Concurrency violation encountered. Object(s) have already been changed by someone else: {}", join_ids(.0))]
    ConcurrencyViolation(Vec<ObjectId>),

    /// Misuse of a transaction, scope or end point lifecycle.
    #[error("{0}")]
    InvalidOperation(String),

    /// Commit-time validation failed (e.g. a mandatory relation is not set).
    #[error("{0}")]
    Validation(String),

    /// The mapping snapshot is inconsistent.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding or decoding of stored data failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn join_ids(ids: &[ObjectId]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DomainError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            DomainError::Argument(_) => error_code::ARGUMENT,
            DomainError::ObjectInvalid(_) => error_code::OBJECT_INVALID,
            DomainError::ObjectsNotFound(_) => error_code::OBJECTS_NOT_FOUND,
            DomainError::Persistence(_) => error_code::PERSISTENCE,
            DomainError::ConcurrencyViolation(_) => error_code::CONCURRENCY_VIOLATION,
            DomainError::InvalidOperation(_) => error_code::INVALID_OPERATION,
            DomainError::Validation(_) => error_code::VALIDATION_FAILED,
            DomainError::Mapping(_) => error_code::MAPPING,
            DomainError::Storage(_) => error_code::STORAGE_ERROR,
            DomainError::Serialization(_) => error_code::SERIALIZATION,
        }
    }

    /// Shorthand for an [`DomainError::ObjectInvalid`] naming the object.
    pub fn object_invalid(id: &ObjectId, reason: &str) -> Self {
        DomainError::ObjectInvalid(format!("Object '{}' is {}.", id, reason))
    }
}
