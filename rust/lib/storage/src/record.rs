use std::collections::{BTreeMap, HashSet};

use domobj_core::{ObjectId, PropertyValue, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// One stored object as returned by a provider: identity, concurrency token
/// and a property-value bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: ObjectId,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub values: BTreeMap<String, PropertyValue>,
}

impl StorageRecord {
    pub fn new(id: ObjectId, timestamp: Timestamp) -> Self {
        Self {
            id,
            timestamp,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn value(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Whether the record's foreign key `property` points at `owner`.
    pub fn references(&self, property: &str, owner: &ObjectId) -> bool {
        self.value(property).and_then(PropertyValue::as_reference) == Some(owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOperation {
    Insert,
    Update,
    Delete,
}

/// One write of a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistRecord {
    pub id: ObjectId,
    pub operation: PersistOperation,
    /// Token the committing transaction loaded; `None` for inserts.
    pub expected_timestamp: Option<Timestamp>,
    pub values: BTreeMap<String, PropertyValue>,
}

impl PersistRecord {
    pub fn insert(id: ObjectId, values: BTreeMap<String, PropertyValue>) -> Self {
        Self {
            id,
            operation: PersistOperation::Insert,
            expected_timestamp: None,
            values,
        }
    }

    pub fn update(id: ObjectId, expected: Timestamp, values: BTreeMap<String, PropertyValue>) -> Self {
        Self {
            id,
            operation: PersistOperation::Update,
            expected_timestamp: Some(expected),
            values,
        }
    }

    pub fn delete(id: ObjectId, expected: Timestamp) -> Self {
        Self {
            id,
            operation: PersistOperation::Delete,
            expected_timestamp: Some(expected),
            values: BTreeMap::new(),
        }
    }
}

/// Validate a persist batch against the currently stored tokens.
///
/// `stored` returns the stored token of an id, or `None` if no record exists.
/// Returns the token every inserted or updated record gets. Nothing may be
/// written when this fails.
pub(crate) fn check_batch<F>(
    records: &[PersistRecord],
    mut stored: F,
) -> Result<Vec<(ObjectId, Timestamp)>, StorageError>
where
    F: FnMut(&ObjectId) -> Result<Option<Timestamp>, StorageError>,
{
    let mut seen = HashSet::new();
    let mut conflicts = Vec::new();
    let mut written = Vec::new();

    for record in records {
        if !seen.insert(&record.id) {
            return Err(StorageError::InvalidRequest(format!(
                "record '{}' appears more than once in one persist batch",
                record.id
            )));
        }
        let current = stored(&record.id)?;
        match record.operation {
            PersistOperation::Insert => {
                if current.is_some() {
                    return Err(StorageError::DuplicateKey(record.id.clone()));
                }
                written.push((record.id.clone(), Timestamp::INITIAL));
            }
            PersistOperation::Update => match current {
                Some(ts) if Some(ts) == record.expected_timestamp => {
                    written.push((record.id.clone(), ts.next()));
                }
                _ => conflicts.push(record.id.clone()),
            },
            PersistOperation::Delete => match current {
                Some(ts) if Some(ts) == record.expected_timestamp => {}
                _ => conflicts.push(record.id.clone()),
            },
        }
    }

    if !conflicts.is_empty() {
        return Err(StorageError::ConcurrencyConflict(conflicts));
    }
    Ok(written)
}
