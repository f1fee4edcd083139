use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use domobj_core::{ClassDefinition, ClassId, KeyType, KeyValue, ObjectId, Timestamp};
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;
use crate::query::Query;
use crate::record::{PersistOperation, PersistRecord, StorageRecord, check_batch};
use crate::traits::StorageProvider;

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Backend("in-memory store lock poisoned".to_string())
}

/// InMemoryStorageProvider keeps records in a `BTreeMap` keyed by id.
///
/// Used by tests and tools that need a store without a file. It counts calls
/// so tests can assert how often the engine reaches the store.
#[derive(Default)]
pub struct InMemoryStorageProvider {
    records: RwLock<BTreeMap<ObjectId, StorageRecord>>,
    sequences: Mutex<BTreeMap<ClassId, i64>>,
    load_calls: AtomicUsize,
    persist_calls: AtomicUsize,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as is, replacing any existing record with the same id.
    pub fn insert(&self, record: StorageRecord) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &ObjectId) -> Result<Option<StorageRecord>, StorageError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `load`, `load_related` and `query` calls so far.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

impl StorageProvider for InMemoryStorageProvider {
    fn load(&self, ids: &[ObjectId]) -> Result<Vec<StorageRecord>, StorageError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read().map_err(poisoned)?;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    fn load_related(
        &self,
        class_id: &ClassId,
        property: &str,
        owner: &ObjectId,
    ) -> Result<Vec<StorageRecord>, StorageError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.id.class_id() == class_id && r.references(property, owner))
            .cloned()
            .collect())
    }

    fn query(&self, query: &Query) -> Result<Vec<StorageRecord>, StorageError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read().map_err(poisoned)?;
        Ok(query.apply(records.values().cloned()))
    }

    fn persist(&self, batch: &[PersistRecord]) -> Result<Vec<(ObjectId, Timestamp)>, StorageError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.write().map_err(poisoned)?;

        let written = check_batch(batch, |id| Ok(records.get(id).map(|r| r.timestamp)))?;
        let tokens: BTreeMap<_, _> = written.iter().cloned().collect();

        for record in batch {
            match record.operation {
                PersistOperation::Delete => {
                    records.remove(&record.id);
                }
                PersistOperation::Insert | PersistOperation::Update => {
                    let timestamp = tokens.get(&record.id).copied().unwrap_or(Timestamp::INITIAL);
                    records.insert(
                        record.id.clone(),
                        StorageRecord {
                            id: record.id.clone(),
                            timestamp,
                            values: record.values.clone(),
                        },
                    );
                }
            }
        }

        debug!("InMemoryStorageProvider: persisted {} records", batch.len());
        Ok(written)
    }

    fn new_object_id(&self, class: &ClassDefinition) -> Result<ObjectId, StorageError> {
        match class.key_type {
            KeyType::Guid => Ok(ObjectId::new(class.id.clone(), KeyValue::Guid(Uuid::new_v4()))),
            KeyType::Int => {
                let records = self.records.read().map_err(poisoned)?;
                let mut sequences = self.sequences.lock().map_err(poisoned)?;
                let last = sequences.entry(class.id.clone()).or_insert_with(|| {
                    records
                        .keys()
                        .filter(|id| id.class_id() == &class.id)
                        .filter_map(|id| match id.value() {
                            KeyValue::Int(n) => Some(*n),
                            _ => None,
                        })
                        .max()
                        .unwrap_or(0)
                });
                *last += 1;
                Ok(ObjectId::new(class.id.clone(), KeyValue::Int(*last)))
            }
            KeyType::Text => Err(StorageError::InvalidRequest(format!(
                "class '{}' uses text keys; ids must be supplied by the caller",
                class.id
            ))),
        }
    }
}
