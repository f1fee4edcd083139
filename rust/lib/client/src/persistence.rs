use std::sync::Arc;

use domobj_core::{ClassDefinition, DomainError, MappingConfiguration, ObjectId, RelationEndPointDefinition, Timestamp};
use domobj_storage::{
    DelegateBasedCommand, MultiIdAssociateCommand, MultipleObjectLoadCommand, ObjectLookupResult, Query, QueryCommand,
    QueryRow, RelatedObjectLoadCommand, SingleIdAssociateCommand, SingleObjectLoadCommand, StorageProvider,
    StorageProviderCommand, StorageRecord, query::to_row,
};
use tracing::{debug, info};

use crate::data_container::DataContainer;
use crate::data_manager::DataManager;

/// Where a transaction loads objects from and where its commit goes.
///
/// The root transaction talks to a [`StorageProvider`]; a sub-transaction
/// reads through to and merges into its parent.
pub trait PersistenceStrategy {
    fn new_object_id(&mut self, class: &ClassDefinition) -> Result<ObjectId, DomainError>;

    fn load_object_data(&mut self, id: &ObjectId) -> Result<ObjectLookupResult<DataContainer>, DomainError>;

    /// Whether an enclosing transaction already holds `id`, loaded, new or
    /// invalid. Nothing encloses a root transaction.
    fn is_known(&mut self, _id: &ObjectId) -> Result<bool, DomainError> {
        Ok(false)
    }

    /// One result per requested id, in request order.
    fn load_object_data_batch(
        &mut self,
        ids: &[ObjectId],
    ) -> Result<Vec<ObjectLookupResult<DataContainer>>, DomainError>;

    /// Objects on the opposite side of the virtual end point `end_point`
    /// of `owner`.
    fn load_related_object_data(
        &mut self,
        end_point: &RelationEndPointDefinition,
        owner: &ObjectId,
    ) -> Result<Vec<DataContainer>, DomainError>;

    fn load_query_objects(&mut self, query: &Query) -> Result<Vec<DataContainer>, DomainError>;

    fn load_query_rows(&mut self, query: &Query, columns: &[String]) -> Result<Vec<QueryRow>, DomainError>;

    /// Write the change set of `data`. Returns the new concurrency tokens of
    /// the written records.
    fn persist(&mut self, data: &DataManager) -> Result<Vec<(ObjectId, Timestamp)>, DomainError>;
}

/// Strategy of a root transaction: every load and commit runs a storage
/// command against the provider.
pub struct RootPersistenceStrategy {
    provider: Arc<dyn StorageProvider>,
    mapping: Arc<MappingConfiguration>,
}

impl RootPersistenceStrategy {
    pub fn new(provider: Arc<dyn StorageProvider>, mapping: Arc<MappingConfiguration>) -> Self {
        Self { provider, mapping }
    }

    fn to_container(&self, record: StorageRecord) -> Result<DataContainer, DomainError> {
        let class = self.mapping.class_of(&record.id)?.clone();
        DataContainer::create_for_existing(record.id, class, record.timestamp, record.values)
    }

    fn to_containers(&self, records: Vec<StorageRecord>) -> Result<Vec<DataContainer>, DomainError> {
        records.into_iter().map(|r| self.to_container(r)).collect()
    }
}

impl PersistenceStrategy for RootPersistenceStrategy {
    fn new_object_id(&mut self, class: &ClassDefinition) -> Result<ObjectId, DomainError> {
        Ok(self.provider.new_object_id(class)?)
    }

    fn load_object_data(&mut self, id: &ObjectId) -> Result<ObjectLookupResult<DataContainer>, DomainError> {
        let command = SingleIdAssociateCommand::new(id.clone(), SingleObjectLoadCommand::new(id.clone()));
        let lookup = command.execute(&*self.provider)?;
        let located = lookup.located.map(|r| self.to_container(r)).transpose()?;
        Ok(ObjectLookupResult::new(lookup.object_id, located))
    }

    fn load_object_data_batch(
        &mut self,
        ids: &[ObjectId],
    ) -> Result<Vec<ObjectLookupResult<DataContainer>>, DomainError> {
        let command = MultiIdAssociateCommand::new(ids.to_vec(), MultipleObjectLoadCommand::new(ids));
        let lookups = command.execute(&*self.provider)?;
        debug!("RootPersistenceStrategy: batch of {} ids", ids.len());
        lookups
            .into_iter()
            .map(|lookup| {
                let located = lookup.located.map(|r| self.to_container(r)).transpose()?;
                Ok(ObjectLookupResult::new(lookup.object_id, located))
            })
            .collect()
    }

    fn load_related_object_data(
        &mut self,
        end_point: &RelationEndPointDefinition,
        owner: &ObjectId,
    ) -> Result<Vec<DataContainer>, DomainError> {
        let command = RelatedObjectLoadCommand::new(
            end_point.opposite_class_id.clone(),
            end_point.opposite_property.clone(),
            owner.clone(),
        );
        let records = command.execute(&*self.provider)?;
        self.to_containers(records)
    }

    fn load_query_objects(&mut self, query: &Query) -> Result<Vec<DataContainer>, DomainError> {
        let records = QueryCommand::new(query.clone()).execute(&*self.provider)?;
        self.to_containers(records)
    }

    fn load_query_rows(&mut self, query: &Query, columns: &[String]) -> Result<Vec<QueryRow>, DomainError> {
        let command = DelegateBasedCommand::new(QueryCommand::new(query.clone()), |records: Vec<StorageRecord>| {
            records.iter().map(|r| to_row(r, columns)).collect::<Vec<_>>()
        });
        command.execute(&*self.provider)
    }

    fn persist(&mut self, data: &DataManager) -> Result<Vec<(ObjectId, Timestamp)>, DomainError> {
        let batch = data.persist_records()?;
        if batch.is_empty() {
            debug!("RootPersistenceStrategy: nothing to persist");
            return Ok(Vec::new());
        }
        info!("RootPersistenceStrategy: persisting {} records", batch.len());
        Ok(self.provider.persist(&batch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use domobj_core::{ClassId, PropertyValue};
    use domobj_storage::FilterOp;

    fn strategy() -> (RootPersistenceStrategy, Arc<domobj_storage::InMemoryStorageProvider>) {
        let store = Arc::new(testing::seeded_store());
        (RootPersistenceStrategy::new(store.clone(), testing::mapping()), store)
    }

    #[test]
    fn single_load_builds_existing_container() {
        let (mut s, _) = strategy();
        let lookup = s.load_object_data(&testing::order1()).unwrap();
        let c = lookup.located.unwrap();
        assert_eq!(c.id(), &testing::order1());
        assert_eq!(c.value("OrderNumber").unwrap(), &PropertyValue::Int(1));
        assert!(c.timestamp().is_some());
    }

    #[test]
    fn batch_keeps_request_order_and_misses() {
        let (mut s, store) = strategy();
        let ids = vec![testing::order3(), testing::order1(), testing::order_item1()];
        let found: Vec<_> = s
            .load_object_data_batch(&ids)
            .unwrap()
            .iter()
            .map(|l| l.located.as_ref().map(|c| c.id().clone()))
            .collect();
        assert_eq!(found[0], Some(testing::order3()));
        assert_eq!(found[1], Some(testing::order1()));
        assert_eq!(found[2], Some(testing::order_item1()));
        assert_eq!(store.load_calls(), 1);

        let missing = ObjectId::int("Order", 999);
        let lookups = s.load_object_data_batch(std::slice::from_ref(&missing)).unwrap();
        assert!(!lookups[0].is_found());
    }

    #[test]
    fn related_load_uses_the_opposite_foreign_key() {
        let (mut s, _) = strategy();
        let mapping = testing::mapping();
        let def = mapping.require_end_point(&ClassId::new("Order"), "OrderItems").unwrap();
        let items = s.load_related_object_data(def, &testing::order1()).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn query_rows_are_projected() {
        let (mut s, _) = strategy();
        let query = Query::new("Order").filter("OrderNumber", FilterOp::Gt, 1i64);
        let rows = s.load_query_rows(&query, &["OrderNumber".to_string()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("OrderNumber"), Some(&PropertyValue::Int(3)));
        assert!(rows[0].contains_key("id"));
    }
}
