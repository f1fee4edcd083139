use std::collections::HashSet;

use domobj_core::{ClassId, DomainError, ObjectId};
use tracing::debug;

use super::StorageProviderCommand;
use crate::query::Query;
use crate::record::StorageRecord;
use crate::traits::StorageProvider;

/// Loads the record of one id.
pub struct SingleObjectLoadCommand {
    id: ObjectId,
}

impl SingleObjectLoadCommand {
    pub fn new(id: ObjectId) -> Self {
        Self { id }
    }
}

impl<P: StorageProvider + ?Sized> StorageProviderCommand<P> for SingleObjectLoadCommand {
    type Output = Option<StorageRecord>;

    fn execute(&self, provider: &P) -> Result<Self::Output, DomainError> {
        let records = provider.load(std::slice::from_ref(&self.id))?;
        if records.len() > 1 {
            debug!("SingleObjectLoadCommand: {} records for {}", records.len(), self.id);
        }
        Ok(records.into_iter().next())
    }
}

/// Loads the records of many ids in one provider call. Repeated ids are
/// requested once.
pub struct MultipleObjectLoadCommand {
    ids: Vec<ObjectId>,
}

impl MultipleObjectLoadCommand {
    pub fn new(ids: &[ObjectId]) -> Self {
        let mut seen = HashSet::new();
        let ids = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();
        Self { ids }
    }
}

impl<P: StorageProvider + ?Sized> StorageProviderCommand<P> for MultipleObjectLoadCommand {
    type Output = Vec<StorageRecord>;

    fn execute(&self, provider: &P) -> Result<Self::Output, DomainError> {
        if self.ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(provider.load(&self.ids)?)
    }
}

/// Loads the objects whose foreign key `property` (declared on `class_id`)
/// points at `owner`.
pub struct RelatedObjectLoadCommand {
    class_id: ClassId,
    property: String,
    owner: ObjectId,
}

impl RelatedObjectLoadCommand {
    pub fn new(class_id: ClassId, property: impl Into<String>, owner: ObjectId) -> Self {
        Self {
            class_id,
            property: property.into(),
            owner,
        }
    }
}

impl<P: StorageProvider + ?Sized> StorageProviderCommand<P> for RelatedObjectLoadCommand {
    type Output = Vec<StorageRecord>;

    fn execute(&self, provider: &P) -> Result<Self::Output, DomainError> {
        Ok(provider.load_related(&self.class_id, &self.property, &self.owner)?)
    }
}

/// Runs a query.
pub struct QueryCommand {
    query: Query,
}

impl QueryCommand {
    pub fn new(query: Query) -> Self {
        Self { query }
    }
}

impl<P: StorageProvider + ?Sized> StorageProviderCommand<P> for QueryCommand {
    type Output = Vec<StorageRecord>;

    fn execute(&self, provider: &P) -> Result<Self::Output, DomainError> {
        Ok(provider.query(&self.query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{MultiIdAssociateCommand, SingleIdAssociateCommand};
    use crate::memory::InMemoryStorageProvider;
    use domobj_core::Timestamp;

    fn seeded() -> InMemoryStorageProvider {
        let store = InMemoryStorageProvider::new();
        for n in [1, 3] {
            store
                .insert(StorageRecord::new(ObjectId::int("Order", n), Timestamp::INITIAL))
                .unwrap();
        }
        store
            .insert(
                StorageRecord::new(ObjectId::int("OrderItem", 1), Timestamp::INITIAL)
                    .with_value("Order", ObjectId::int("Order", 1)),
            )
            .unwrap();
        store
    }

    #[test]
    fn single_load_through_associate() {
        let store = seeded();
        let id = ObjectId::int("Order", 3);
        let command = SingleIdAssociateCommand::new(id.clone(), SingleObjectLoadCommand::new(id));
        assert!(command.execute(&store).unwrap().is_found());
    }

    #[test]
    fn multi_load_requests_each_id_once() {
        let store = seeded();
        let ids = vec![
            ObjectId::int("Order", 1),
            ObjectId::int("Order", 2),
            ObjectId::int("Order", 1),
        ];
        let command = MultiIdAssociateCommand::new(ids.clone(), MultipleObjectLoadCommand::new(&ids));
        let found: Vec<_> = command.execute(&store).unwrap().iter().map(|r| r.is_found()).collect();
        assert_eq!(found, vec![true, false, true]);
        assert_eq!(store.load_calls(), 1);
    }

    #[test]
    fn commands_run_against_trait_objects() {
        let store = seeded();
        let provider: &dyn StorageProvider = &store;
        let command = RelatedObjectLoadCommand::new(
            ClassId::new("OrderItem"),
            "Order",
            ObjectId::int("Order", 1),
        );
        assert_eq!(command.execute(provider).unwrap().len(), 1);

        let all = QueryCommand::new(Query::new("Order")).execute(provider).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn empty_batch_skips_the_store() {
        let store = seeded();
        assert!(MultipleObjectLoadCommand::new(&[]).execute(&store).unwrap().is_empty());
        assert_eq!(store.load_calls(), 0);
    }
}
