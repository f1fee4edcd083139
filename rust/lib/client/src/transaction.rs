use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use domobj_core::{
    ClassDefinition, ClassId, DomainError, EndPointKind, MappingConfiguration, ObjectId, PropertyValue,
    RelationEndPointDefinition, Timestamp,
};
use domobj_storage::{ObjectLookupResult, Query, QueryRow, StorageProvider};
use tracing::{debug, info, warn};

use crate::data_container::DataContainer;
use crate::data_manager::{ChangeSet, DataManager};
use crate::end_point::{RelationEndPoint, RelationEndPointId};
use crate::listener::{TransactionEvent, TransactionListener};
use crate::persistence::{PersistenceStrategy, RootPersistenceStrategy};
use crate::scope::{ScopeGuard, ScopeStack};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique handle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    RollingBack,
    Discarded,
}

/// A unit of work over domain objects.
///
/// A root transaction reads from and commits to a storage provider. A
/// sub-transaction (see [`create_subtransaction`](Self::create_subtransaction))
/// borrows its parent mutably, reads through to it and commits into it.
pub struct ClientTransaction<'p> {
    id: TransactionId,
    parent_id: Option<TransactionId>,
    mapping: Arc<MappingConfiguration>,
    data_manager: DataManager,
    strategy: Box<dyn PersistenceStrategy + 'p>,
    state: TransactionState,
    listeners: Vec<Box<dyn TransactionListener + 'p>>,
}

impl ClientTransaction<'static> {
    pub fn new_root(mapping: Arc<MappingConfiguration>, provider: Arc<dyn StorageProvider>) -> Self {
        let strategy = RootPersistenceStrategy::new(provider, mapping.clone());
        let tx = ClientTransaction::with_strategy(TransactionId::next(), None, mapping, Box::new(strategy));
        debug!("ClientTransaction {}: created root", tx.id);
        tx
    }
}

impl<'p> ClientTransaction<'p> {
    fn with_strategy(
        id: TransactionId,
        parent_id: Option<TransactionId>,
        mapping: Arc<MappingConfiguration>,
        strategy: Box<dyn PersistenceStrategy + 'p>,
    ) -> Self {
        Self {
            id,
            parent_id,
            data_manager: DataManager::new(mapping.clone()),
            mapping,
            strategy,
            state: TransactionState::Active,
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn parent_id(&self) -> Option<TransactionId> {
        self.parent_id
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn mapping(&self) -> &Arc<MappingConfiguration> {
        &self.mapping
    }

    pub fn add_listener(&mut self, listener: impl TransactionListener + 'p) {
        self.listeners.push(Box::new(listener));
    }

    /// Push this transaction onto `stack`; it stays current until the guard
    /// is dropped or left.
    pub fn enter_scope<'s>(&self, stack: &'s ScopeStack) -> Result<ScopeGuard<'s>, DomainError> {
        self.ensure_active()?;
        Ok(stack.enter(self.id))
    }

    // ── Objects ─────────────────────────────────────────────────────

    /// Create a new object with an id allocated by the persistence strategy.
    pub fn new_object(&mut self, class_id: &ClassId) -> Result<ObjectId, DomainError> {
        self.ensure_active()?;
        let class = self.mapping.class(class_id)?.clone();
        let id = self.strategy.new_object_id(&class)?;
        self.new_object_with_id(id.clone())?;
        Ok(id)
    }

    pub fn new_object_with_id(&mut self, id: ObjectId) -> Result<(), DomainError> {
        self.ensure_active()?;
        let class = self.mapping.class_of(&id)?.clone();
        let container = DataContainer::create_new(id, class)?;
        self.run(|dm, s| {
            if s.is_known(container.id())? {
                return Err(DomainError::InvalidOperation(format!(
                    "Object '{}' is already part of an enclosing transaction.",
                    container.id()
                )));
            }
            dm.register_new(container)
        })
    }

    pub fn get_object(&mut self, id: &ObjectId) -> Result<&DataContainer, DomainError> {
        self.run(|dm, s| dm.get_object(id, false, s).map(|_| ()))?;
        self.registered(id)
    }

    /// Like [`get_object`](Self::get_object) but also returns objects
    /// deleted in this transaction.
    pub fn get_object_including_deleted(&mut self, id: &ObjectId) -> Result<&DataContainer, DomainError> {
        self.run(|dm, s| dm.get_object(id, true, s).map(|_| ()))?;
        self.registered(id)
    }

    /// One slot per requested id, `None` where no object exists.
    pub fn get_objects(&mut self, ids: &[ObjectId]) -> Result<Vec<Option<&DataContainer>>, DomainError> {
        self.run(|dm, s| dm.get_objects(ids, s).map(|_| ()))?;
        Ok(ids.iter().map(|id| self.data_manager.container(id)).collect())
    }

    /// Load every id in one batch; fails if any of them does not exist.
    pub fn ensure_data_available(&mut self, ids: &[ObjectId]) -> Result<(), DomainError> {
        let missing: Vec<ObjectId> = self
            .get_objects(ids)?
            .iter()
            .zip(ids)
            .filter(|(found, _)| found.is_none())
            .map(|(_, id)| id.clone())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DomainError::ObjectsNotFound(missing))
        }
    }

    pub fn value(&mut self, id: &ObjectId, property: &str) -> Result<PropertyValue, DomainError> {
        Ok(self.get_object(id)?.value(property)?.clone())
    }

    pub fn set_value(
        &mut self,
        id: &ObjectId,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), DomainError> {
        let value = value.into();
        self.run(|dm, s| dm.set_value(id, property, value, s))
    }

    pub fn mark_as_changed(&mut self, id: &ObjectId) -> Result<(), DomainError> {
        self.run(|dm, s| dm.mark_as_changed(id, s))
    }

    pub fn delete(&mut self, id: &ObjectId) -> Result<(), DomainError> {
        self.run(|dm, s| dm.delete(id, s))
    }

    // ── Relations ───────────────────────────────────────────────────

    pub fn end_point(&mut self, id: &RelationEndPointId) -> Result<&RelationEndPoint, DomainError> {
        self.run(|dm, s| dm.get_or_load(id, s).map(|_| ()))?;
        self.data_manager
            .end_point(id)
            .ok_or_else(|| DomainError::InvalidOperation(format!("End point '{}' is not registered.", id)))
    }

    pub fn related_object(&mut self, id: &ObjectId, property: &str) -> Result<Option<ObjectId>, DomainError> {
        self.run(|dm, s| dm.related_object(id, property, s))
    }

    pub fn related_objects(&mut self, id: &ObjectId, property: &str) -> Result<Vec<ObjectId>, DomainError> {
        self.run(|dm, s| dm.related_objects(id, property, s))
    }

    /// Containers of a collection end point, in collection order.
    pub fn load_related_objects(&mut self, id: &ObjectId, property: &str) -> Result<Vec<&DataContainer>, DomainError> {
        let ids = self.related_objects(id, property)?;
        ids.iter().map(|id| self.registered(id)).collect()
    }

    pub fn set_related_object(
        &mut self,
        id: &ObjectId,
        property: &str,
        target: Option<&ObjectId>,
    ) -> Result<(), DomainError> {
        let target = target.cloned();
        self.run(|dm, s| dm.set_related_object(id, property, target, s))
    }

    pub fn add_related(&mut self, owner: &ObjectId, property: &str, member: &ObjectId) -> Result<(), DomainError> {
        self.run(|dm, s| dm.add_related(owner, property, member, s))
    }

    pub fn insert_related(
        &mut self,
        owner: &ObjectId,
        property: &str,
        index: usize,
        member: &ObjectId,
    ) -> Result<(), DomainError> {
        self.run(|dm, s| dm.insert_related(owner, property, index, member, s))
    }

    pub fn remove_related(&mut self, owner: &ObjectId, property: &str, member: &ObjectId) -> Result<bool, DomainError> {
        self.run(|dm, s| dm.remove_related(owner, property, member, s))
    }

    pub fn replace_related(&mut self, owner: &ObjectId, property: &str, members: Vec<ObjectId>) -> Result<(), DomainError> {
        self.run(|dm, s| dm.replace_related(owner, property, members, s))
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Objects matching `query`, resolved through the identity map.
    pub fn query(&mut self, query: &Query) -> Result<Vec<&DataContainer>, DomainError> {
        let ids = self.run(|dm, s| dm.query(query, s))?;
        ids.iter().map(|id| self.registered(id)).collect()
    }

    /// Anonymous rows; nothing is registered.
    pub fn query_rows(&mut self, query: &Query, columns: &[String]) -> Result<Vec<QueryRow>, DomainError> {
        self.ensure_active()?;
        self.mapping.class(&query.class_id)?;
        self.strategy.load_query_rows(query, columns)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn change_set(&self) -> ChangeSet<'_> {
        self.data_manager.change_set()
    }

    pub fn has_changed(&self) -> bool {
        !self.data_manager.change_set().is_empty()
    }

    /// Write the change set through the persistence strategy. On failure no
    /// container changes state.
    pub fn commit(&mut self) -> Result<(), DomainError> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;
        let result = self.commit_changes();
        self.state = TransactionState::Active;
        self.dispatch();
        result
    }

    fn commit_changes(&mut self) -> Result<(), DomainError> {
        self.data_manager.validate_mandatory()?;
        let ids = self.data_manager.change_set().ids();
        self.emit(TransactionEvent::Committing(ids));
        let written = match self.strategy.persist(&self.data_manager) {
            Ok(written) => written,
            Err(e) => {
                if let DomainError::ConcurrencyViolation(ids) = &e {
                    warn!("ClientTransaction {}: concurrency violation on {} objects", self.id, ids.len());
                }
                return Err(e);
            }
        };
        let committed = self.data_manager.commit(&written);
        info!("ClientTransaction {}: committed {} objects", self.id, committed.len());
        self.dispatch();
        self.emit(TransactionEvent::Committed(committed));
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), DomainError> {
        self.ensure_active()?;
        self.state = TransactionState::RollingBack;
        let rolled_back = self.data_manager.rollback();
        self.state = TransactionState::Active;
        info!("ClientTransaction {}: rolled back {} objects", self.id, rolled_back.len());
        self.dispatch();
        self.emit(TransactionEvent::RolledBack(rolled_back));
        Ok(())
    }

    /// Forget everything. The transaction cannot be used afterwards.
    pub fn discard(&mut self) {
        if self.state == TransactionState::Discarded {
            return;
        }
        self.data_manager.discard();
        self.state = TransactionState::Discarded;
        debug!("ClientTransaction {}: discarded", self.id);
        self.emit(TransactionEvent::Discarded);
    }

    /// Open a child transaction. The parent cannot be used until the child
    /// is dropped.
    pub fn create_subtransaction(&mut self) -> Result<ClientTransaction<'_>, DomainError> {
        self.ensure_active()?;
        let child_id = TransactionId::next();
        let parent_id = self.id;
        self.emit(TransactionEvent::SubTransactionCreated(child_id));
        debug!("ClientTransaction {}: created sub-transaction {}", parent_id, child_id);
        let mapping = self.mapping.clone();
        Ok(ClientTransaction::with_strategy(
            child_id,
            Some(parent_id),
            mapping,
            Box::new(SubPersistenceStrategy { parent: self }),
        ))
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_active(&self) -> Result<(), DomainError> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(DomainError::InvalidOperation(format!(
                "Transaction {} is {:?}.",
                self.id, state
            ))),
        }
    }

    /// Run one data manager operation, then hand its events to listeners.
    fn run<T>(
        &mut self,
        operation: impl FnOnce(&mut DataManager, &mut dyn PersistenceStrategy) -> Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        self.ensure_active()?;
        let result = operation(&mut self.data_manager, self.strategy.as_mut());
        self.dispatch();
        result
    }

    fn registered(&self, id: &ObjectId) -> Result<&DataContainer, DomainError> {
        self.data_manager.container(id).ok_or_else(|| {
            DomainError::InvalidOperation(format!("Object '{}' is not registered in transaction {}.", id, self.id))
        })
    }

    fn dispatch(&mut self) {
        for event in self.data_manager.drain_events() {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: TransactionEvent) {
        for listener in &mut self.listeners {
            listener.on_event(self.id, &event);
        }
    }

    fn merge_from_child(&mut self, child: &DataManager) -> Result<(), DomainError> {
        let result = self.run(|dm, s| dm.merge_from(child, s));
        if result.is_ok() {
            info!("ClientTransaction {}: merged sub-transaction changes", self.id);
        }
        result
    }
}

/// Strategy of a sub-transaction: loads copy the parent's current state,
/// commits merge into the parent.
struct SubPersistenceStrategy<'a, 'p> {
    parent: &'a mut ClientTransaction<'p>,
}

impl PersistenceStrategy for SubPersistenceStrategy<'_, '_> {
    fn new_object_id(&mut self, class: &ClassDefinition) -> Result<ObjectId, DomainError> {
        self.parent.ensure_active()?;
        self.parent.strategy.new_object_id(class)
    }

    fn is_known(&mut self, id: &ObjectId) -> Result<bool, DomainError> {
        let parent = &mut *self.parent;
        if parent.data_manager.container(id).is_some() || parent.data_manager.is_invalid(id) {
            return Ok(true);
        }
        parent.strategy.is_known(id)
    }

    fn load_object_data(&mut self, id: &ObjectId) -> Result<ObjectLookupResult<DataContainer>, DomainError> {
        match self.parent.get_object(id) {
            Ok(container) => Ok(ObjectLookupResult::new(id.clone(), Some(container.copy_for_subtransaction()))),
            Err(DomainError::ObjectsNotFound(_)) => Ok(ObjectLookupResult::new(id.clone(), None)),
            Err(e) => Err(e),
        }
    }

    fn load_object_data_batch(
        &mut self,
        ids: &[ObjectId],
    ) -> Result<Vec<ObjectLookupResult<DataContainer>>, DomainError> {
        let found = self.parent.get_objects(ids)?;
        Ok(ids
            .iter()
            .zip(found)
            .map(|(id, c)| ObjectLookupResult::new(id.clone(), c.map(DataContainer::copy_for_subtransaction)))
            .collect())
    }

    fn load_related_object_data(
        &mut self,
        end_point: &RelationEndPointDefinition,
        owner: &ObjectId,
    ) -> Result<Vec<DataContainer>, DomainError> {
        let ids: Vec<ObjectId> = if end_point.kind == EndPointKind::Collection {
            self.parent.related_objects(owner, &end_point.property)?
        } else {
            self.parent.related_object(owner, &end_point.property)?.into_iter().collect()
        };
        ids.iter()
            .map(|id| self.parent.get_object(id).map(DataContainer::copy_for_subtransaction))
            .collect()
    }

    fn load_query_objects(&mut self, query: &Query) -> Result<Vec<DataContainer>, DomainError> {
        Ok(self
            .parent
            .query(query)?
            .into_iter()
            .map(DataContainer::copy_for_subtransaction)
            .collect())
    }

    fn load_query_rows(&mut self, query: &Query, columns: &[String]) -> Result<Vec<QueryRow>, DomainError> {
        self.parent.query_rows(query, columns)
    }

    fn persist(&mut self, data: &DataManager) -> Result<Vec<(ObjectId, Timestamp)>, DomainError> {
        self.parent.merge_from_child(data)?;
        Ok(Vec::new())
    }
}
