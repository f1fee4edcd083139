use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use domobj_core::{ClassDefinition, ClassId, KeyType, KeyValue, ObjectId, PropertyValue, Timestamp};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::query::Query;
use crate::record::{PersistOperation, PersistRecord, StorageRecord, check_batch};
use crate::traits::StorageProvider;

/// `ObjectId` string form → JSON-encoded [`StoredRecord`].
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
/// Class id → last integer key handed out.
const SEQUENCES: TableDefinition<&str, i64> = TableDefinition::new("sequences");

/// Value layout of the records table; the id is the key.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    timestamp: Timestamp,
    values: BTreeMap<String, PropertyValue>,
}

fn backend<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn decode(key: &str, bytes: &[u8]) -> Result<StorageRecord, StorageError> {
    let id: ObjectId = key
        .parse()
        .map_err(|e| StorageError::Serialization(format!("bad record key '{}': {}", key, e)))?;
    let stored: StoredRecord = serde_json::from_slice(bytes)?;
    Ok(StorageRecord {
        id,
        timestamp: stored.timestamp,
        values: stored.values,
    })
}

/// RedbStorageProvider stores records in a redb database file.
///
/// Keys are `ObjectId` strings, so all records of a class share the
/// `Class|` prefix and class scans are range reads.
pub struct RedbStorageProvider {
    db: Arc<Database>,
}

impl RedbStorageProvider {
    /// Open or create a redb database at the given path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(backend)?;

        // Ensure both tables exist.
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _records = write_txn.open_table(RECORDS).map_err(backend)?;
            let _sequences = write_txn.open_table(SEQUENCES).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        debug!("RedbStorageProvider: opened {:?}", path);
        Ok(Self { db: Arc::new(db) })
    }

    /// Store `record` as is, replacing any existing record with the same id.
    pub fn insert(&self, record: &StorageRecord) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&StoredRecord {
            timestamp: record.timestamp,
            values: record.values.clone(),
        })?;
        let key = record.id.to_string();

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(RECORDS).map_err(backend)?;
            table.insert(key.as_str(), bytes.as_slice()).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }

    /// Every record of `class_id`, in key order.
    pub fn scan_class(&self, class_id: &ClassId) -> Result<Vec<StorageRecord>, StorageError> {
        let prefix = ObjectId::class_prefix(class_id);
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(RECORDS).map_err(backend)?;

        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(backend)? {
            let (key, value) = entry.map_err(backend)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            results.push(decode(key.value(), value.value())?);
        }
        Ok(results)
    }
}

impl StorageProvider for RedbStorageProvider {
    fn load(&self, ids: &[ObjectId]) -> Result<Vec<StorageRecord>, StorageError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(RECORDS).map_err(backend)?;

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let key = id.to_string();
            if let Some(value) = table.get(key.as_str()).map_err(backend)? {
                results.push(decode(&key, value.value())?);
            }
        }
        Ok(results)
    }

    fn load_related(
        &self,
        class_id: &ClassId,
        property: &str,
        owner: &ObjectId,
    ) -> Result<Vec<StorageRecord>, StorageError> {
        Ok(self
            .scan_class(class_id)?
            .into_iter()
            .filter(|r| r.references(property, owner))
            .collect())
    }

    fn query(&self, query: &Query) -> Result<Vec<StorageRecord>, StorageError> {
        Ok(query.apply(self.scan_class(&query.class_id)?))
    }

    fn persist(&self, batch: &[PersistRecord]) -> Result<Vec<(ObjectId, Timestamp)>, StorageError> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        let written = {
            let mut table = write_txn.open_table(RECORDS).map_err(backend)?;

            let checked = check_batch(batch, |id| {
                let key = id.to_string();
                match table.get(key.as_str()).map_err(backend)? {
                    Some(value) => Ok(Some(decode(&key, value.value())?.timestamp)),
                    None => Ok(None),
                }
            });
            let written = match checked {
                Ok(written) => written,
                Err(e) => {
                    drop(table);
                    if let StorageError::ConcurrencyConflict(ids) = &e {
                        warn!("RedbStorageProvider: {} stale records, batch rejected", ids.len());
                    }
                    write_txn.abort().map_err(backend)?;
                    return Err(e);
                }
            };
            let tokens: BTreeMap<_, _> = written.iter().cloned().collect();

            for record in batch {
                let key = record.id.to_string();
                match record.operation {
                    PersistOperation::Delete => {
                        table.remove(key.as_str()).map_err(backend)?;
                    }
                    PersistOperation::Insert | PersistOperation::Update => {
                        let bytes = serde_json::to_vec(&StoredRecord {
                            timestamp: tokens.get(&record.id).copied().unwrap_or(Timestamp::INITIAL),
                            values: record.values.clone(),
                        })?;
                        table.insert(key.as_str(), bytes.as_slice()).map_err(backend)?;
                    }
                }
            }
            written
        };
        write_txn.commit().map_err(backend)?;

        debug!("RedbStorageProvider: persisted {} records", batch.len());
        Ok(written)
    }

    fn new_object_id(&self, class: &ClassDefinition) -> Result<ObjectId, StorageError> {
        match class.key_type {
            KeyType::Guid => Ok(ObjectId::new(class.id.clone(), KeyValue::Guid(Uuid::new_v4()))),
            KeyType::Int => {
                // Seed from the stored keys the first time a class asks.
                let seed = self
                    .scan_class(&class.id)?
                    .iter()
                    .filter_map(|r| match r.id.value() {
                        KeyValue::Int(n) => Some(*n),
                        _ => None,
                    })
                    .max()
                    .unwrap_or(0);

                let write_txn = self.db.begin_write().map_err(backend)?;
                let next = {
                    let mut table = write_txn.open_table(SEQUENCES).map_err(backend)?;
                    let last = match table.get(class.id.as_str()).map_err(backend)? {
                        Some(value) => value.value(),
                        None => seed,
                    };
                    let next = last + 1;
                    table.insert(class.id.as_str(), next).map_err(backend)?;
                    next
                };
                write_txn.commit().map_err(backend)?;
                Ok(ObjectId::new(class.id.clone(), KeyValue::Int(next)))
            }
            KeyType::Text => Err(StorageError::InvalidRequest(format!(
                "class '{}' uses text keys; ids must be supplied by the caller",
                class.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> RedbStorageProvider {
        RedbStorageProvider::open(&tmp.path().join("test.redb")).unwrap()
    }

    #[test]
    fn test_insert_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let id = ObjectId::int("Order", 1);
        store
            .insert(&StorageRecord::new(id.clone(), Timestamp(2)).with_value("OrderNumber", 7i64))
            .unwrap();

        let records = store.load(&[id.clone(), ObjectId::int("Order", 9)]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].timestamp, Timestamp(2));
        assert_eq!(records[0].value("OrderNumber"), Some(&PropertyValue::Int(7)));
    }

    #[test]
    fn test_scan_stops_at_class_boundary() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.insert(&StorageRecord::new(ObjectId::int("Order", 1), Timestamp::INITIAL)).unwrap();
        store.insert(&StorageRecord::new(ObjectId::int("Order", 2), Timestamp::INITIAL)).unwrap();
        store
            .insert(&StorageRecord::new(ObjectId::int("OrderItem", 1), Timestamp::INITIAL))
            .unwrap();

        assert_eq!(store.scan_class(&ClassId::new("Order")).unwrap().len(), 2);
        assert_eq!(store.scan_class(&ClassId::new("OrderItem")).unwrap().len(), 1);
        assert!(store.scan_class(&ClassId::new("Customer")).unwrap().is_empty());
    }

    #[test]
    fn test_persist_is_atomic() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let existing = ObjectId::int("Order", 1);
        store.insert(&StorageRecord::new(existing.clone(), Timestamp(5))).unwrap();

        let stale = store.persist(&[
            PersistRecord::insert(ObjectId::int("Order", 2), BTreeMap::new()),
            PersistRecord::update(existing.clone(), Timestamp(4), BTreeMap::new()),
        ]);
        assert!(matches!(stale, Err(StorageError::ConcurrencyConflict(_))));
        assert!(store.load(&[ObjectId::int("Order", 2)]).unwrap().is_empty());

        let written = store
            .persist(&[PersistRecord::delete(existing.clone(), Timestamp(5))])
            .unwrap();
        assert!(written.is_empty());
        assert!(store.load(&[existing]).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_records_and_sequences() {
        let tmp = TempDir::new().unwrap();
        let class = ClassDefinition::new("Order", KeyType::Int);
        {
            let store = open(&tmp);
            store.insert(&StorageRecord::new(ObjectId::int("Order", 10), Timestamp::INITIAL)).unwrap();
            assert_eq!(store.new_object_id(&class).unwrap(), ObjectId::int("Order", 11));
        }
        let store = open(&tmp);
        assert_eq!(store.load(&[ObjectId::int("Order", 10)]).unwrap().len(), 1);
        assert_eq!(store.new_object_id(&class).unwrap(), ObjectId::int("Order", 12));
    }

    #[test]
    fn test_query_and_related() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let order = ObjectId::int("Order", 1);
        for (n, pos) in [(1, 3i64), (2, 1), (3, 2)] {
            store
                .insert(
                    &StorageRecord::new(ObjectId::int("OrderItem", n), Timestamp::INITIAL)
                        .with_value("Order", order.clone())
                        .with_value("Position", pos),
                )
                .unwrap();
        }

        let related = store
            .load_related(&ClassId::new("OrderItem"), "Order", &order)
            .unwrap();
        assert_eq!(related.len(), 3);

        let query = Query::new("OrderItem")
            .order_by(domobj_core::SortExpression::ascending("Position"))
            .limit(2);
        let ids: Vec<_> = store.query(&query).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ObjectId::int("OrderItem", 2), ObjectId::int("OrderItem", 3)]);
    }
}
