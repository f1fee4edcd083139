use domobj_core::{ClassDefinition, ClassId, ObjectId, Timestamp};

use crate::error::StorageError;
use crate::query::Query;
use crate::record::{PersistRecord, StorageRecord};

/// StorageProvider is the storage execution context the command pipeline runs
/// against.
///
/// Providers are shared between transactions (`Arc<dyn StorageProvider>`) and
/// do their own locking.
pub trait StorageProvider: Send + Sync {
    /// Load the records of `ids`. Missing ids are simply absent; the result
    /// order is unspecified and may contain duplicates.
    fn load(&self, ids: &[ObjectId]) -> Result<Vec<StorageRecord>, StorageError>;

    /// Load every record of `class_id` whose foreign key `property` points
    /// at `owner`.
    fn load_related(
        &self,
        class_id: &ClassId,
        property: &str,
        owner: &ObjectId,
    ) -> Result<Vec<StorageRecord>, StorageError>;

    /// Run a query and return the matching records in query order.
    fn query(&self, query: &Query) -> Result<Vec<StorageRecord>, StorageError>;

    /// Write a commit batch atomically. Either every record is written and the
    /// new tokens of inserted and updated records are returned, or nothing is
    /// written.
    fn persist(&self, records: &[PersistRecord]) -> Result<Vec<(ObjectId, Timestamp)>, StorageError>;

    /// Allocate a fresh id for a new object of `class`.
    fn new_object_id(&self, class: &ClassDefinition) -> Result<ObjectId, StorageError>;
}
