use domobj_core::{DomainError, ObjectId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored tokens differ from the expected ones (or the record is gone).
    #[error("concurrency conflict on {} record(s)", .0.len())]
    ConcurrencyConflict(Vec<ObjectId>),

    #[error("record already exists: {0}")]
    DuplicateKey(ObjectId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<StorageError> for DomainError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Backend(msg) => DomainError::Storage(msg),
            StorageError::Serialization(msg) => DomainError::Serialization(msg),
            StorageError::ConcurrencyConflict(ids) => DomainError::ConcurrencyViolation(ids),
            StorageError::DuplicateKey(id) => {
                DomainError::Persistence(format!("Object '{}' already exists in the store.", id))
            }
            StorageError::InvalidRequest(msg) => DomainError::Argument(msg),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_becomes_concurrency_violation() {
        let id = ObjectId::int("Order", 1);
        let err: DomainError = StorageError::ConcurrencyConflict(vec![id.clone()]).into();
        match err {
            DomainError::ConcurrencyViolation(ids) => assert_eq!(ids, vec![id]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn backend_failure_keeps_its_message() {
        let err: DomainError = StorageError::Backend("disk full".into()).into();
        assert_eq!(err.error_code(), "STORAGE_ERROR");
        assert_eq!(err.to_string(), "storage error: disk full");
    }
}
