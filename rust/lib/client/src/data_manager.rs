//! Identity map and relation registry of one transaction.
//!
//! Every mutating relation operation runs in two phases: `plan_link` does
//! all loading and validation, `apply_link` only changes registered state.
//! A failing load therefore leaves the graph as it was.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domobj_core::{
    DomainError, DuplicatePolicy, EndPointKind, IncompleteSync, MappingConfiguration, ObjectId, PropertyValue,
    RelationEndPointDefinition, SortDirection, Timestamp,
};
use domobj_storage::{PersistRecord, Query};
use tracing::debug;

use crate::data_container::{DataContainer, DataContainerState, StateTransition};
use crate::end_point::{CollectionEndPoint, RelationEndPoint, RelationEndPointId, VirtualObjectEndPoint};
use crate::listener::TransactionEvent;
use crate::persistence::PersistenceStrategy;

static NULL: PropertyValue = PropertyValue::Null;

/// Containers that a commit has to write, each list sorted by id.
#[derive(Debug, Default)]
pub struct ChangeSet<'a> {
    pub new: Vec<&'a DataContainer>,
    pub changed: Vec<&'a DataContainer>,
    pub deleted: Vec<&'a DataContainer>,
}

impl ChangeSet<'_> {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.new.len() + self.changed.len() + self.deleted.len()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.new
            .iter()
            .chain(&self.changed)
            .chain(&self.deleted)
            .map(|c| c.id().clone())
            .collect()
    }
}

struct LinkPlan {
    object: ObjectId,
    real: RelationEndPointDefinition,
    opposite: RelationEndPointDefinition,
    old_target: Option<ObjectId>,
    new_target: Option<ObjectId>,
    /// Previous partner of `new_target` in a one-to-one relation.
    displaced: Option<ObjectId>,
    position: Option<usize>,
}

pub struct DataManager {
    mapping: Arc<MappingConfiguration>,
    containers: HashMap<ObjectId, DataContainer>,
    end_points: HashMap<RelationEndPointId, RelationEndPoint>,
    invalid: HashSet<ObjectId>,
    events: Vec<TransactionEvent>,
}

impl DataManager {
    pub fn new(mapping: Arc<MappingConfiguration>) -> Self {
        Self {
            mapping,
            containers: HashMap::new(),
            end_points: HashMap::new(),
            invalid: HashSet::new(),
            events: Vec::new(),
        }
    }

    pub fn mapping(&self) -> &Arc<MappingConfiguration> {
        &self.mapping
    }

    /// Registered container of `id`, without loading.
    pub fn container(&self, id: &ObjectId) -> Option<&DataContainer> {
        self.containers.get(id)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn is_invalid(&self, id: &ObjectId) -> bool {
        self.invalid.contains(id)
    }

    /// Registered end point, without loading.
    pub fn end_point(&self, id: &RelationEndPointId) -> Option<&RelationEndPoint> {
        self.end_points.get(id)
    }

    // ── Objects ─────────────────────────────────────────────────────

    pub fn get_object(
        &mut self,
        id: &ObjectId,
        include_deleted: bool,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<&DataContainer, DomainError> {
        self.ensure_registered(id, strategy)?;
        let container = self.registered(id)?;
        if container.state() == DataContainerState::Deleted && !include_deleted {
            return Err(DomainError::object_invalid(id, "deleted"));
        }
        Ok(container)
    }

    /// One slot per requested id, `None` where storage has no record. Misses
    /// are loaded in a single batch.
    pub fn get_objects(
        &mut self,
        ids: &[ObjectId],
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<Vec<Option<&DataContainer>>, DomainError> {
        if let Some(id) = ids.iter().find(|id| self.invalid.contains(*id)) {
            return Err(DomainError::object_invalid(id, "invalid in this transaction"));
        }
        let mut seen = HashSet::new();
        let missing: Vec<ObjectId> = ids
            .iter()
            .filter(|id| !self.containers.contains_key(*id) && seen.insert(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            debug!("DataManager: loading {} of {} objects", missing.len(), ids.len());
            let lookups = strategy.load_object_data_batch(&missing)?;
            self.register_loaded(lookups.into_iter().filter_map(|l| l.located).collect());
        }
        ids.iter()
            .map(|id| match self.containers.get(id) {
                Some(c) if c.state() == DataContainerState::Deleted => {
                    Err(DomainError::object_invalid(id, "deleted"))
                }
                found => Ok(found),
            })
            .collect()
    }

    pub fn register_new(&mut self, container: DataContainer) -> Result<(), DomainError> {
        let id = container.id().clone();
        if container.state() != DataContainerState::New {
            return Err(DomainError::Argument(format!(
                "Object '{}' is {:?}, expected a new object.",
                id,
                container.state()
            )));
        }
        if self.containers.contains_key(&id) || self.invalid.contains(&id) {
            return Err(DomainError::InvalidOperation(format!(
                "Object '{}' is already part of this transaction.",
                id
            )));
        }
        let mapping = self.mapping.clone();
        for def in mapping.end_points_of(id.class_id()) {
            let ep_id = RelationEndPointId::new(id.clone(), def.property.clone());
            self.end_points.insert(ep_id.clone(), RelationEndPoint::empty(ep_id, def));
        }
        debug!("DataManager: registered new object {}", id);
        self.containers.insert(id.clone(), container);
        self.events.push(TransactionEvent::NewObject(id));
        Ok(())
    }

    /// Run `query` and register its results. Objects deleted in this
    /// transaction are left out; registered instances win over fresh rows.
    pub fn query(&mut self, query: &Query, strategy: &mut dyn PersistenceStrategy) -> Result<Vec<ObjectId>, DomainError> {
        self.mapping.class(&query.class_id)?;
        let loaded = strategy.load_query_objects(query)?;
        let ids = self.register_loaded(loaded);
        Ok(ids
            .into_iter()
            .filter(|id| {
                self.containers
                    .get(id)
                    .is_some_and(|c| c.state() != DataContainerState::Deleted)
            })
            .collect())
    }

    /// Scalar properties are written directly; foreign keys go through
    /// relation synchronization.
    pub fn set_value(
        &mut self,
        id: &ObjectId,
        property: &str,
        value: PropertyValue,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        self.get_object(id, true, strategy)?;
        if let Some(def) = self.mapping.end_point(id.class_id(), property).cloned() {
            if def.kind != EndPointKind::RealObject {
                return Err(DomainError::Argument(format!(
                    "'{}.{}' is a virtual relation end point and has no value.",
                    id.class_id(),
                    property
                )));
            }
            let target = match value {
                PropertyValue::Null => None,
                PropertyValue::Reference(target) => Some(target),
                other => {
                    return Err(DomainError::Argument(format!(
                        "Value {} does not fit relation property '{}' of object '{}'.",
                        other, property, id
                    )));
                }
            };
            return self.link(id, &def, target, None, strategy);
        }
        self.write_value(id, property, value)?;
        self.resort_after_change(id, property);
        Ok(())
    }

    /// Force an unchanged object into the change set.
    pub fn mark_as_changed(&mut self, id: &ObjectId, strategy: &mut dyn PersistenceStrategy) -> Result<(), DomainError> {
        self.get_object(id, true, strategy)?;
        if let Some(t) = self.registered_mut(id)?.mark_as_changed()? {
            self.record_transition(id, t);
        }
        Ok(())
    }

    /// Delete `id` and clear every relation it takes part in.
    pub fn delete(&mut self, id: &ObjectId, strategy: &mut dyn PersistenceStrategy) -> Result<(), DomainError> {
        if self.get_object(id, true, strategy)?.state() == DataContainerState::Deleted {
            return Ok(());
        }
        let mapping = self.mapping.clone();
        let defs: Vec<RelationEndPointDefinition> = mapping.end_points_of(id.class_id()).into_iter().cloned().collect();

        // Load first so that a failing load changes nothing.
        for def in &defs {
            let ep_id = RelationEndPointId::new(id.clone(), def.property.clone());
            self.ensure_loaded(&ep_id, def, strategy)?;
            if def.kind == EndPointKind::RealObject
                && def.opposite_kind == EndPointKind::Collection
                && def.incomplete_sync == IncompleteSync::LoadFirst
            {
                if let Some(owner) = self.registered(id)?.value(&def.property)?.as_reference().cloned() {
                    let opposite = self.opposite_of(def)?;
                    self.get_object(&owner, true, strategy)?;
                    let owner_ep = RelationEndPointId::new(owner, opposite.property.clone());
                    self.complete_collection(&owner_ep, &opposite, strategy)?;
                }
            }
        }

        for def in &defs {
            let ep_id = RelationEndPointId::new(id.clone(), def.property.clone());
            match def.kind {
                EndPointKind::RealObject => self.link(id, def, None, None, strategy)?,
                EndPointKind::VirtualObject => {
                    if let Some(partner) = self.virtual_ref(&ep_id)?.opposite_object_id()?.cloned() {
                        let real = self.opposite_of(def)?;
                        self.link(&partner, &real, None, None, strategy)?;
                    }
                }
                EndPointKind::Collection => {
                    let members = self.collection_ref(&ep_id)?.members()?.to_vec();
                    let real = self.opposite_of(def)?;
                    for member in &members {
                        self.link(member, &real, None, None, strategy)?;
                    }
                }
            }
        }

        if let Some(t) = self.registered_mut(id)?.mark_deleted()? {
            self.record_transition(id, t);
        }
        self.events.push(TransactionEvent::ObjectDeleted(id.clone()));
        if self.registered(id)?.state() == DataContainerState::Invalid {
            self.forget(id);
        }
        debug!("DataManager: deleted {}", id);
        Ok(())
    }

    // ── Relations ───────────────────────────────────────────────────

    /// Registered end point, loaded if it is virtual.
    pub fn get_or_load(
        &mut self,
        ep_id: &RelationEndPointId,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<&RelationEndPoint, DomainError> {
        self.get_object(&ep_id.object_id, false, strategy)?;
        let def = self.definition(&ep_id.object_id, &ep_id.property)?;
        self.ensure_loaded(ep_id, &def, strategy)?;
        self.end_points.get(ep_id).ok_or_else(|| wrong_kind(ep_id))
    }

    pub fn related_object(
        &mut self,
        id: &ObjectId,
        property: &str,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<Option<ObjectId>, DomainError> {
        self.get_object(id, false, strategy)?;
        let def = self.definition(id, property)?;
        let ep_id = RelationEndPointId::new(id.clone(), property);
        match def.kind {
            EndPointKind::RealObject => {
                self.ensure_loaded(&ep_id, &def, strategy)?;
                match self.end_points.get(&ep_id) {
                    Some(RelationEndPoint::RealObject(ep)) => ep.opposite_object_id(self.registered(id)?),
                    _ => Err(wrong_kind(&ep_id)),
                }
            }
            EndPointKind::VirtualObject => {
                self.load_virtual_end_point(&ep_id, &def, strategy)?;
                Ok(self.virtual_ref(&ep_id)?.opposite_object_id()?.cloned())
            }
            EndPointKind::Collection => Err(DomainError::Argument(format!(
                "'{}.{}' is a collection end point.",
                id.class_id(),
                property
            ))),
        }
    }

    /// Members of a collection end point, completing it first.
    pub fn related_objects(
        &mut self,
        id: &ObjectId,
        property: &str,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<Vec<ObjectId>, DomainError> {
        let (ep_id, def) = self.collection_definition(id, property, strategy)?;
        self.complete_collection(&ep_id, &def, strategy)?;
        Ok(self.collection_ref(&ep_id)?.members()?.to_vec())
    }

    /// Set a single-valued end point, from either side of the relation.
    pub fn set_related_object(
        &mut self,
        id: &ObjectId,
        property: &str,
        target: Option<ObjectId>,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        self.get_object(id, false, strategy)?;
        let def = self.definition(id, property)?;
        match def.kind {
            EndPointKind::RealObject => self.link(id, &def, target, None, strategy),
            EndPointKind::VirtualObject => {
                let ep_id = RelationEndPointId::new(id.clone(), property);
                self.load_virtual_end_point(&ep_id, &def, strategy)?;
                let current = self.virtual_ref(&ep_id)?.opposite_object_id()?.cloned();
                if current == target {
                    return Ok(());
                }
                let real = self.opposite_of(&def)?;
                match (target, current) {
                    (Some(target), _) => {
                        check_class(&target, &def)?;
                        self.link(&target, &real, Some(id.clone()), None, strategy)
                    }
                    (None, Some(current)) => self.link(&current, &real, None, None, strategy),
                    (None, None) => Ok(()),
                }
            }
            EndPointKind::Collection => Err(DomainError::Argument(format!(
                "'{}.{}' is a collection end point.",
                id.class_id(),
                property
            ))),
        }
    }

    pub fn add_related(
        &mut self,
        owner: &ObjectId,
        property: &str,
        member: &ObjectId,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        self.insert_member(owner, property, member, None, strategy)
    }

    /// Insert at `index`; completes the collection to check the bound.
    pub fn insert_related(
        &mut self,
        owner: &ObjectId,
        property: &str,
        index: usize,
        member: &ObjectId,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        self.insert_member(owner, property, member, Some(index), strategy)
    }

    /// Returns `false` when `member` is not part of the collection.
    pub fn remove_related(
        &mut self,
        owner: &ObjectId,
        property: &str,
        member: &ObjectId,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<bool, DomainError> {
        let (ep_id, def) = self.collection_definition(owner, property, strategy)?;
        if def.incomplete_sync == IncompleteSync::LoadFirst {
            self.complete_collection(&ep_id, &def, strategy)?;
        }
        if member.class_id() != &def.opposite_class_id {
            return Ok(false);
        }
        let current_owner = self
            .get_object(member, false, strategy)?
            .value(&def.opposite_property)?
            .as_reference()
            .cloned();
        if current_owner.as_ref() != Some(owner) {
            return Ok(false);
        }
        let real = self.opposite_of(&def)?;
        self.link(member, &real, None, None, strategy)?;
        Ok(true)
    }

    /// Replace the whole collection. Members that are dropped lose their
    /// foreign key; new ones leave their previous owner.
    pub fn replace_related(
        &mut self,
        owner: &ObjectId,
        property: &str,
        members: Vec<ObjectId>,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        let (ep_id, def) = self.collection_definition(owner, property, strategy)?;
        self.complete_collection(&ep_id, &def, strategy)?;

        let mut seen = HashSet::new();
        let mut wanted = Vec::with_capacity(members.len());
        for member in members {
            check_class(&member, &def)?;
            if !seen.insert(member.clone()) {
                match def.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        return Err(DomainError::InvalidOperation(format!(
                            "'{}' would contain object '{}' twice.",
                            ep_id, member
                        )));
                    }
                    DuplicatePolicy::Ignore => continue,
                }
            }
            wanted.push(member);
        }
        let missing: Vec<ObjectId> = self
            .get_objects(&wanted, strategy)?
            .iter()
            .zip(&wanted)
            .filter(|(found, _)| found.is_none())
            .map(|(_, id)| id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(DomainError::ObjectsNotFound(missing));
        }

        let current = self.collection_ref(&ep_id)?.members()?.to_vec();
        let real = self.opposite_of(&def)?;
        for member in current.iter().filter(|m| !seen.contains(*m)) {
            self.link(member, &real, None, None, strategy)?;
        }
        for member in wanted.iter().filter(|m| !current.contains(m)) {
            self.link(member, &real, Some(owner.clone()), None, strategy)?;
        }
        if def.sort.is_none() {
            self.collection_mut(&ep_id)?.set_order(wanted)?;
        }
        self.events.push(TransactionEvent::RelationChanged(ep_id));
        Ok(())
    }

    /// Give a complete collection a new order of the same members.
    pub fn reorder_collection(
        &mut self,
        ep_id: &RelationEndPointId,
        order: Vec<ObjectId>,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        let (ep_id, def) = self.collection_definition(&ep_id.object_id, &ep_id.property, strategy)?;
        self.complete_collection(&ep_id, &def, strategy)?;
        let collection = self.collection_mut(&ep_id)?;
        if collection.members()? == order.as_slice() {
            return Ok(());
        }
        collection.set_order(order)?;
        self.events.push(TransactionEvent::RelationChanged(ep_id));
        Ok(())
    }

    // ── Commit ──────────────────────────────────────────────────────

    pub fn change_set(&self) -> ChangeSet<'_> {
        let mut changes = ChangeSet::default();
        for container in self.containers.values() {
            match container.state() {
                DataContainerState::New => changes.new.push(container),
                DataContainerState::Changed => changes.changed.push(container),
                DataContainerState::Deleted => changes.deleted.push(container),
                _ => {}
            }
        }
        for list in [&mut changes.new, &mut changes.changed, &mut changes.deleted] {
            list.sort_by(|a, b| a.id().cmp(b.id()));
        }
        changes
    }

    /// Storage records for the current change set.
    pub fn persist_records(&self) -> Result<Vec<PersistRecord>, DomainError> {
        let changes = self.change_set();
        let mut batch = Vec::with_capacity(changes.len());
        for c in &changes.new {
            batch.push(PersistRecord::insert(c.id().clone(), c.to_value_map()));
        }
        for c in &changes.changed {
            batch.push(PersistRecord::update(c.id().clone(), token(c)?, c.to_value_map()));
        }
        for c in &changes.deleted {
            batch.push(PersistRecord::delete(c.id().clone(), token(c)?));
        }
        Ok(batch)
    }

    /// Unsorted collections of live owners whose member order differs from
    /// the original.
    pub fn changed_collections(&self) -> Vec<(RelationEndPointId, Vec<ObjectId>)> {
        let mut result: Vec<_> = self
            .end_points
            .values()
            .filter_map(RelationEndPoint::as_collection)
            .filter(|c| c.sort().is_none() && c.has_changed())
            .filter(|c| {
                self.containers
                    .get(&c.id().object_id)
                    .is_some_and(|owner| owner.state().is_writable())
            })
            .filter_map(|c| c.members().ok().map(|m| (c.id().clone(), m.to_vec())))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    /// Mandatory foreign keys of new and changed objects must be set.
    pub fn validate_mandatory(&self) -> Result<(), DomainError> {
        let changes = self.change_set();
        for container in changes.new.iter().chain(&changes.changed) {
            for def in self.mapping.end_points_of(&container.class().id) {
                if def.kind == EndPointKind::RealObject && def.mandatory && container.value(&def.property)?.is_null() {
                    return Err(DomainError::Validation(format!(
                        "Mandatory relation property '{}.{}' of object '{}' is not set.",
                        def.class_id,
                        def.property,
                        container.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Adopt current state everywhere. `written` carries the new concurrency
    /// tokens from storage. Returns the ids that changed state.
    pub fn commit(&mut self, written: &[(ObjectId, Timestamp)]) -> Vec<ObjectId> {
        let tokens: HashMap<&ObjectId, Timestamp> = written.iter().map(|(id, ts)| (id, *ts)).collect();
        let mut committed = Vec::new();
        let mut discarded = Vec::new();
        for id in self.sorted_ids() {
            let Some(container) = self.containers.get_mut(&id) else {
                continue;
            };
            if let Some(ts) = tokens.get(&id) {
                container.set_timestamp(*ts);
            }
            if let Some(t) = container.commit() {
                if t.to == DataContainerState::Discarded {
                    discarded.push(id.clone());
                }
                self.record_transition(&id, t);
                committed.push(id);
            }
        }
        for ep in self.end_points.values_mut() {
            ep.commit();
        }
        for id in &discarded {
            self.forget(id);
        }
        committed
    }

    /// Restore original state everywhere. Returns the ids that changed state.
    pub fn rollback(&mut self) -> Vec<ObjectId> {
        let mut rolled_back = Vec::new();
        let mut discarded = Vec::new();
        for id in self.sorted_ids() {
            let Some(container) = self.containers.get_mut(&id) else {
                continue;
            };
            if let Some(t) = container.rollback() {
                if t.to == DataContainerState::Discarded {
                    discarded.push(id.clone());
                }
                self.record_transition(&id, t);
                rolled_back.push(id);
            }
        }
        for ep in self.end_points.values_mut() {
            ep.rollback();
        }
        for id in &discarded {
            self.forget(id);
        }
        // Originals keep load order; sorted collections need their key order back.
        let sorted: Vec<RelationEndPointId> = self
            .end_points
            .values()
            .filter_map(RelationEndPoint::as_collection)
            .filter(|c| c.sort().is_some())
            .map(|c| c.id().clone())
            .collect();
        for ep_id in &sorted {
            self.sort_collection(ep_id);
        }
        rolled_back
    }

    pub fn discard(&mut self) {
        self.containers.clear();
        self.end_points.clear();
        self.invalid.clear();
        self.events.clear();
    }

    /// Apply the change set of a committing sub-transaction. Either the
    /// whole change set lands or this data manager is left as it was.
    pub fn merge_from(&mut self, child: &DataManager, strategy: &mut dyn PersistenceStrategy) -> Result<(), DomainError> {
        let changes = child.change_set();
        for c in &changes.new {
            if self.containers.contains_key(c.id()) || self.invalid.contains(c.id()) {
                return Err(DomainError::InvalidOperation(format!(
                    "New object '{}' of a sub-transaction is already known to its parent.",
                    c.id()
                )));
            }
        }

        let snapshot = (
            self.containers.clone(),
            self.end_points.clone(),
            self.invalid.clone(),
            self.events.len(),
        );
        let result = self.apply_child_changes(child, strategy);
        if result.is_err() {
            let (containers, end_points, invalid, events) = snapshot;
            self.containers = containers;
            self.end_points = end_points;
            self.invalid = invalid;
            self.events.truncate(events);
            debug!("DataManager: merge from a sub-transaction failed, parent state restored");
        }
        result
    }

    fn apply_child_changes(&mut self, child: &DataManager, strategy: &mut dyn PersistenceStrategy) -> Result<(), DomainError> {
        let changes = child.change_set();
        for c in &changes.new {
            self.register_new(DataContainer::create_new(c.id().clone(), c.class().clone())?)?;
        }
        for c in changes.new.iter().chain(&changes.changed) {
            let mut written = false;
            for (property, value) in c.values() {
                let current = self.get_object(c.id(), false, strategy)?.value(&property.name)?.clone();
                if &current != value {
                    self.set_value(c.id(), &property.name, value.clone(), strategy)?;
                    written = true;
                }
            }
            if !written && c.state() == DataContainerState::Changed {
                self.mark_as_changed(c.id(), strategy)?;
            }
        }
        for c in &changes.deleted {
            self.delete(c.id(), strategy)?;
        }
        for (ep_id, order) in child.changed_collections() {
            self.reorder_collection(&ep_id, order, strategy)?;
        }
        debug!("DataManager: merged {} changed objects from a sub-transaction", changes.len());
        Ok(())
    }

    pub fn drain_events(&mut self) -> Vec<TransactionEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_registered(&mut self, id: &ObjectId, strategy: &mut dyn PersistenceStrategy) -> Result<(), DomainError> {
        if self.invalid.contains(id) {
            return Err(DomainError::object_invalid(id, "invalid in this transaction"));
        }
        if self.containers.contains_key(id) {
            debug!("DataManager: identity map hit for {}", id);
            return Ok(());
        }
        debug!("DataManager: identity map miss for {}", id);
        match strategy.load_object_data(id)?.located {
            Some(container) => {
                self.register_loaded(vec![container]);
                Ok(())
            }
            None => Err(DomainError::ObjectsNotFound(vec![id.clone()])),
        }
    }

    /// Register loaded containers unless the id is already known. Returns
    /// every id in input order.
    fn register_loaded(&mut self, containers: Vec<DataContainer>) -> Vec<ObjectId> {
        let mut ids = Vec::with_capacity(containers.len());
        let mut registered = Vec::new();
        for container in containers {
            let id = container.id().clone();
            if !self.invalid.contains(&id) && !self.containers.contains_key(&id) {
                self.note_foreign_keys(&container);
                self.containers.insert(id.clone(), container);
                registered.push(id.clone());
            }
            ids.push(id);
        }
        if !registered.is_empty() {
            debug!("DataManager: registered {} loaded objects", registered.len());
            self.events.push(TransactionEvent::ObjectsLoaded(registered));
        }
        ids
    }

    /// A loaded object that points at a registered owner becomes a known
    /// member of the owner's incomplete collection.
    fn note_foreign_keys(&mut self, container: &DataContainer) {
        let mapping = self.mapping.clone();
        for def in mapping.end_points_of(container.id().class_id()) {
            if def.kind != EndPointKind::RealObject || def.opposite_kind != EndPointKind::Collection {
                continue;
            }
            let Some(owner) = container.value(&def.property).ok().and_then(PropertyValue::as_reference) else {
                continue;
            };
            if !self.containers.contains_key(owner) {
                continue;
            }
            let Ok(opposite) = mapping.opposite(def) else {
                continue;
            };
            let ep_id = RelationEndPointId::new(owner.clone(), opposite.property.clone());
            if let Some(collection) = self.register_end_point(&ep_id, opposite).as_collection_mut() {
                collection.note_member(container.id());
            }
        }
    }

    fn ensure_loaded(
        &mut self,
        ep_id: &RelationEndPointId,
        def: &RelationEndPointDefinition,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        match def.kind {
            EndPointKind::RealObject => {
                self.register_end_point(ep_id, def);
                Ok(())
            }
            EndPointKind::VirtualObject => self.load_virtual_end_point(ep_id, def, strategy),
            EndPointKind::Collection => self.complete_collection(ep_id, def, strategy),
        }
    }

    fn register_end_point(
        &mut self,
        ep_id: &RelationEndPointId,
        def: &RelationEndPointDefinition,
    ) -> &mut RelationEndPoint {
        self.end_points
            .entry(ep_id.clone())
            .or_insert_with(|| RelationEndPoint::unloaded(ep_id.clone(), def))
    }

    fn load_virtual_end_point(
        &mut self,
        ep_id: &RelationEndPointId,
        def: &RelationEndPointDefinition,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        let started = match self.register_end_point(ep_id, def).as_virtual_object_mut() {
            Some(ep) => ep.begin_load()?,
            None => return Err(wrong_kind(ep_id)),
        };
        if !started {
            return Ok(());
        }
        debug!("DataManager: loading end point {}", ep_id);
        let result = self.resolve_virtual(ep_id, def, strategy);
        let ep = self
            .end_points
            .get_mut(ep_id)
            .and_then(RelationEndPoint::as_virtual_object_mut)
            .ok_or_else(|| wrong_kind(ep_id))?;
        match result {
            Ok((current, original)) => {
                ep.finish_load(current, original);
                Ok(())
            }
            Err(e) => {
                ep.abort_load();
                Err(e)
            }
        }
    }

    fn resolve_virtual(
        &mut self,
        ep_id: &RelationEndPointId,
        def: &RelationEndPointDefinition,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(Option<ObjectId>, Option<ObjectId>), DomainError> {
        let loaded = strategy.load_related_object_data(def, &ep_id.object_id)?;
        let loaded = self.register_loaded(loaded);
        let current = self.objects_pointing_at(&ep_id.object_id, def, &loaded, false);
        if current.len() > 1 {
            let ids: Vec<String> = current.iter().map(ToString::to_string).collect();
            return Err(DomainError::Persistence(format!(
                "More than one object points at '{}' through the one-to-one relation '{}': {}.",
                ep_id.object_id,
                def.relation_id,
                ids.join(", ")
            )));
        }
        let original = self.objects_pointing_at(&ep_id.object_id, def, &loaded, true);
        Ok((current.into_iter().next(), original.into_iter().next()))
    }

    fn complete_collection(
        &mut self,
        ep_id: &RelationEndPointId,
        def: &RelationEndPointDefinition,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        let started = match self.register_end_point(ep_id, def).as_collection_mut() {
            Some(collection) => collection.begin_load()?,
            None => return Err(wrong_kind(ep_id)),
        };
        if !started {
            return Ok(());
        }
        debug!("DataManager: completing collection {}", ep_id);
        let result = self.resolve_collection(ep_id, def, strategy);
        let collection = self.collection_mut(ep_id)?;
        match result {
            Ok((current, original)) => collection.finish_load(current, original),
            Err(e) => {
                collection.abort_load();
                return Err(e);
            }
        }
        self.sort_collection(ep_id);
        Ok(())
    }

    /// Storage rows first, then members known before the load, then any
    /// other registered object that points at the owner.
    fn resolve_collection(
        &mut self,
        ep_id: &RelationEndPointId,
        def: &RelationEndPointDefinition,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>), DomainError> {
        let loaded = strategy.load_related_object_data(def, &ep_id.object_id)?;
        let loaded = self.register_loaded(loaded);
        let mut preferred = loaded.clone();
        preferred.extend_from_slice(self.collection_ref(ep_id)?.loading_known());
        let current = self.objects_pointing_at(&ep_id.object_id, def, &preferred, false);
        let original = self.objects_pointing_at(&ep_id.object_id, def, &loaded, true);
        Ok((current, original))
    }

    /// Registered objects whose foreign key (current, or original for
    /// non-new objects) points at `owner`. `preferred` ids come first in
    /// their order, the rest sorted by id.
    fn objects_pointing_at(
        &self,
        owner: &ObjectId,
        def: &RelationEndPointDefinition,
        preferred: &[ObjectId],
        original: bool,
    ) -> Vec<ObjectId> {
        let foreign_key = def.opposite_property.as_str();
        let points = |c: &DataContainer| {
            if c.class().id != def.opposite_class_id {
                return false;
            }
            let value = if original {
                if c.state() == DataContainerState::New {
                    return false;
                }
                c.original_value(foreign_key)
            } else {
                if !c.state().is_writable() {
                    return false;
                }
                c.value(foreign_key)
            };
            value.ok().and_then(PropertyValue::as_reference) == Some(owner)
        };

        let mut seen = HashSet::new();
        let mut result: Vec<ObjectId> = preferred
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .filter(|id| self.containers.get(*id).is_some_and(|c| points(c)))
            .cloned()
            .collect();
        let mut rest: Vec<ObjectId> = self
            .containers
            .values()
            .filter(|c| !seen.contains(c.id()) && points(c))
            .map(|c| c.id().clone())
            .collect();
        rest.sort();
        result.extend(rest);
        result
    }

    fn sort_collection(&mut self, ep_id: &RelationEndPointId) {
        let Some(collection) = self.end_points.get(ep_id).and_then(RelationEndPoint::as_collection) else {
            return;
        };
        let Some(sort) = collection.sort().cloned() else {
            return;
        };
        let keys: HashMap<ObjectId, PropertyValue> = collection
            .known_members()
            .iter()
            .map(|m| {
                let key = self
                    .containers
                    .get(m)
                    .and_then(|c| c.value(&sort.property).ok())
                    .cloned()
                    .unwrap_or(PropertyValue::Null);
                (m.clone(), key)
            })
            .collect();
        if let Some(collection) = self.end_points.get_mut(ep_id).and_then(RelationEndPoint::as_collection_mut) {
            collection.sort_by(|a, b| {
                let order = keys.get(a).unwrap_or(&NULL).compare(keys.get(b).unwrap_or(&NULL));
                match sort.direction {
                    SortDirection::Ascending => order,
                    SortDirection::Descending => order.reverse(),
                }
            });
        }
    }

    /// Re-sort the collections `id` belongs to that are ordered by `property`.
    fn resort_after_change(&mut self, id: &ObjectId, property: &str) {
        let mapping = self.mapping.clone();
        for def in mapping.end_points_of(id.class_id()) {
            if def.kind != EndPointKind::RealObject || def.opposite_kind != EndPointKind::Collection {
                continue;
            }
            let sorted_by_property = mapping
                .opposite(def)
                .ok()
                .and_then(|o| o.sort.as_ref())
                .is_some_and(|s| s.property == property);
            if !sorted_by_property {
                continue;
            }
            let owner = self
                .containers
                .get(id)
                .and_then(|c| c.value(&def.property).ok())
                .and_then(PropertyValue::as_reference)
                .cloned();
            if let Some(owner) = owner {
                self.sort_collection(&RelationEndPointId::new(owner, def.opposite_property.clone()));
            }
        }
    }

    fn link(
        &mut self,
        object: &ObjectId,
        real: &RelationEndPointDefinition,
        new_target: Option<ObjectId>,
        position: Option<usize>,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        if let Some(plan) = self.plan_link(object, real, new_target, position, strategy)? {
            self.apply_link(plan)?;
        }
        Ok(())
    }

    fn plan_link(
        &mut self,
        object: &ObjectId,
        real: &RelationEndPointDefinition,
        new_target: Option<ObjectId>,
        position: Option<usize>,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<Option<LinkPlan>, DomainError> {
        if object.class_id() != &real.class_id {
            return Err(DomainError::Argument(format!(
                "Object '{}' has no relation property '{}.{}'.",
                object, real.class_id, real.property
            )));
        }
        self.ensure_writable(object, strategy)?;
        let old_target = self.registered(object)?.value(&real.property)?.as_reference().cloned();
        if old_target == new_target {
            return Ok(None);
        }
        if let Some(target) = &new_target {
            check_class(target, real)?;
            self.get_object(target, false, strategy)?;
        }

        let opposite = self.opposite_of(real)?;
        let mut displaced = None;
        match opposite.kind {
            EndPointKind::VirtualObject => {
                if let Some(target) = &new_target {
                    let ep_id = RelationEndPointId::new(target.clone(), opposite.property.clone());
                    self.load_virtual_end_point(&ep_id, &opposite, strategy)?;
                    displaced = self
                        .virtual_ref(&ep_id)?
                        .opposite_object_id()?
                        .filter(|d| *d != object)
                        .cloned();
                    if let Some(d) = &displaced {
                        self.ensure_writable(d, strategy)?;
                    }
                }
            }
            EndPointKind::Collection => {
                if opposite.incomplete_sync == IncompleteSync::LoadFirst {
                    for owner in old_target.iter().chain(new_target.iter()) {
                        self.get_object(owner, true, strategy)?;
                        let ep_id = RelationEndPointId::new(owner.clone(), opposite.property.clone());
                        self.complete_collection(&ep_id, &opposite, strategy)?;
                    }
                }
            }
            EndPointKind::RealObject => {
                return Err(DomainError::Mapping(format!(
                    "relation '{}' has a foreign key on both sides",
                    real.relation_id
                )));
            }
        }

        Ok(Some(LinkPlan {
            object: object.clone(),
            real: real.clone(),
            opposite,
            old_target,
            new_target,
            displaced,
            position,
        }))
    }

    fn apply_link(&mut self, plan: LinkPlan) -> Result<(), DomainError> {
        let LinkPlan {
            object,
            real,
            opposite,
            old_target,
            new_target,
            displaced,
            position,
        } = plan;

        self.write_value(&object, &real.property, PropertyValue::reference(new_target.clone()))?;
        self.events.push(TransactionEvent::RelationChanged(RelationEndPointId::new(
            object.clone(),
            real.property.clone(),
        )));

        if opposite.kind == EndPointKind::VirtualObject {
            if let Some(old) = &old_target {
                self.set_virtual_if_loaded(old, &opposite.property, None)?;
            }
            if let Some(d) = &displaced {
                self.write_value(d, &real.property, PropertyValue::Null)?;
                self.events.push(TransactionEvent::RelationChanged(RelationEndPointId::new(
                    d.clone(),
                    real.property.clone(),
                )));
            }
            if let Some(new) = &new_target {
                self.set_virtual_if_loaded(new, &opposite.property, Some(object.clone()))?;
            }
            return Ok(());
        }

        if let Some(old) = &old_target {
            let ep_id = RelationEndPointId::new(old.clone(), opposite.property.clone());
            if let Some(collection) = self.end_points.get_mut(&ep_id).and_then(RelationEndPoint::as_collection_mut) {
                collection.remove_member(&object);
                self.events.push(TransactionEvent::RelationChanged(ep_id));
            }
        }
        if let Some(new) = &new_target {
            let ep_id = RelationEndPointId::new(new.clone(), opposite.property.clone());
            if let Some(collection) = self.register_end_point(&ep_id, &opposite).as_collection_mut() {
                collection.add_member(object.clone(), position);
            }
            self.sort_collection(&ep_id);
            self.events.push(TransactionEvent::RelationChanged(ep_id));
        }
        Ok(())
    }

    fn set_virtual_if_loaded(
        &mut self,
        owner: &ObjectId,
        property: &str,
        opposite: Option<ObjectId>,
    ) -> Result<(), DomainError> {
        let ep_id = RelationEndPointId::new(owner.clone(), property);
        if let Some(ep) = self.end_points.get_mut(&ep_id).and_then(RelationEndPoint::as_virtual_object_mut) {
            if ep.is_complete() {
                ep.set_opposite_object_id(opposite)?;
                self.events.push(TransactionEvent::RelationChanged(ep_id));
            }
        }
        Ok(())
    }

    fn insert_member(
        &mut self,
        owner: &ObjectId,
        property: &str,
        member: &ObjectId,
        position: Option<usize>,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(), DomainError> {
        let (ep_id, def) = self.collection_definition(owner, property, strategy)?;
        check_class(member, &def)?;
        if position.is_some() || def.incomplete_sync == IncompleteSync::LoadFirst {
            self.complete_collection(&ep_id, &def, strategy)?;
        }
        if let Some(index) = position {
            let len = self.collection_ref(&ep_id)?.members()?.len();
            if index > len {
                return Err(DomainError::Argument(format!(
                    "Index {} is out of range for '{}' with {} members.",
                    index, ep_id, len
                )));
            }
        }
        let current_owner = self
            .get_object(member, false, strategy)?
            .value(&def.opposite_property)?
            .as_reference()
            .cloned();
        if current_owner.as_ref() == Some(owner) {
            return match def.duplicate_policy {
                DuplicatePolicy::Reject => Err(DomainError::InvalidOperation(format!(
                    "'{}' already contains object '{}'.",
                    ep_id, member
                ))),
                DuplicatePolicy::Ignore => {
                    debug!("DataManager: {} already contains {}", ep_id, member);
                    Ok(())
                }
            };
        }
        let real = self.opposite_of(&def)?;
        self.link(member, &real, Some(owner.clone()), position, strategy)
    }

    fn collection_definition(
        &mut self,
        owner: &ObjectId,
        property: &str,
        strategy: &mut dyn PersistenceStrategy,
    ) -> Result<(RelationEndPointId, RelationEndPointDefinition), DomainError> {
        self.get_object(owner, false, strategy)?;
        let def = self.definition(owner, property)?;
        if def.kind != EndPointKind::Collection {
            return Err(DomainError::Argument(format!(
                "'{}.{}' is not a collection end point.",
                owner.class_id(),
                property
            )));
        }
        Ok((RelationEndPointId::new(owner.clone(), property), def))
    }

    fn write_value(&mut self, id: &ObjectId, property: &str, value: PropertyValue) -> Result<(), DomainError> {
        let container = self.registered_mut(id)?;
        let old = container.value(property)?.clone();
        let transition = container.set_value(property, value.clone())?;
        if old != value {
            self.events.push(TransactionEvent::PropertyChanged {
                object_id: id.clone(),
                property: property.to_string(),
                old,
                new: value,
            });
        }
        if let Some(t) = transition {
            self.record_transition(id, t);
        }
        Ok(())
    }

    fn record_transition(&mut self, id: &ObjectId, transition: StateTransition) {
        debug!("DataManager: {} {:?} -> {:?}", id, transition.from, transition.to);
        self.events.push(TransactionEvent::StateChanged {
            object_id: id.clone(),
            transition,
        });
    }

    fn ensure_writable(&mut self, id: &ObjectId, strategy: &mut dyn PersistenceStrategy) -> Result<(), DomainError> {
        let state = self.get_object(id, true, strategy)?.state();
        if !state.is_writable() {
            return Err(DomainError::InvalidOperation(format!(
                "Object '{}' is {:?} and cannot be changed.",
                id, state
            )));
        }
        Ok(())
    }

    fn forget(&mut self, id: &ObjectId) {
        self.containers.remove(id);
        self.end_points.retain(|ep_id, _| &ep_id.object_id != id);
        self.invalid.insert(id.clone());
    }

    fn sorted_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn definition(&self, id: &ObjectId, property: &str) -> Result<RelationEndPointDefinition, DomainError> {
        Ok(self.mapping.require_end_point(id.class_id(), property)?.clone())
    }

    fn opposite_of(&self, def: &RelationEndPointDefinition) -> Result<RelationEndPointDefinition, DomainError> {
        Ok(self.mapping.opposite(def)?.clone())
    }

    fn registered(&self, id: &ObjectId) -> Result<&DataContainer, DomainError> {
        self.containers.get(id).ok_or_else(|| not_registered(id))
    }

    fn registered_mut(&mut self, id: &ObjectId) -> Result<&mut DataContainer, DomainError> {
        self.containers.get_mut(id).ok_or_else(|| not_registered(id))
    }

    fn virtual_ref(&self, ep_id: &RelationEndPointId) -> Result<&VirtualObjectEndPoint, DomainError> {
        self.end_points
            .get(ep_id)
            .and_then(RelationEndPoint::as_virtual_object)
            .ok_or_else(|| wrong_kind(ep_id))
    }

    fn collection_ref(&self, ep_id: &RelationEndPointId) -> Result<&CollectionEndPoint, DomainError> {
        self.end_points
            .get(ep_id)
            .and_then(RelationEndPoint::as_collection)
            .ok_or_else(|| wrong_kind(ep_id))
    }

    fn collection_mut(&mut self, ep_id: &RelationEndPointId) -> Result<&mut CollectionEndPoint, DomainError> {
        self.end_points
            .get_mut(ep_id)
            .and_then(RelationEndPoint::as_collection_mut)
            .ok_or_else(|| wrong_kind(ep_id))
    }
}

/// `target` must be of the class on the other side of `def`.
fn check_class(target: &ObjectId, def: &RelationEndPointDefinition) -> Result<(), DomainError> {
    if target.class_id() != &def.opposite_class_id {
        return Err(DomainError::Argument(format!(
            "Object '{}' cannot be related through '{}.{}': expected class '{}'.",
            target, def.class_id, def.property, def.opposite_class_id
        )));
    }
    Ok(())
}

fn token(container: &DataContainer) -> Result<Timestamp, DomainError> {
    container.timestamp().ok_or_else(|| {
        DomainError::Persistence(format!("Object '{}' has no concurrency token.", container.id()))
    })
}

fn not_registered(id: &ObjectId) -> DomainError {
    DomainError::InvalidOperation(format!("Object '{}' is not registered in this transaction.", id))
}

fn wrong_kind(ep_id: &RelationEndPointId) -> DomainError {
    DomainError::InvalidOperation(format!("End point '{}' is registered with a different kind.", ep_id))
}
