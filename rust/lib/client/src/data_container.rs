use std::collections::BTreeMap;
use std::sync::Arc;

use domobj_core::{ClassDefinition, DomainError, ObjectId, PropertyDefinition, PropertyValue, Timestamp};
use domobj_storage::Identified;

/// Lifecycle state of a [`DataContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataContainerState {
    /// Created in this transaction, never persisted.
    New,
    /// Loaded and unchanged.
    Existing,
    Changed,
    /// Marked for deletion; removed from the store at commit.
    Deleted,
    /// Gone after a rollback of a new object or a committed delete.
    Discarded,
    /// Unusable in this transaction (e.g. a new object that was deleted).
    Invalid,
}

impl DataContainerState {
    /// Whether property writes and relation changes are allowed.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            DataContainerState::New | DataContainerState::Existing | DataContainerState::Changed
        )
    }
}

/// A state change reported to the owning data manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: DataContainerState,
    pub to: DataContainerState,
}

#[derive(Debug, Clone, PartialEq)]
struct PropertySlot {
    current: PropertyValue,
    original: PropertyValue,
}

/// In-memory state of one object in one transaction.
///
/// Property slots follow the declaration order of the class definition.
/// Foreign keys are ordinary `Reference` slots; keeping them consistent with
/// the opposite end points is the data manager's job.
#[derive(Debug, Clone)]
pub struct DataContainer {
    id: ObjectId,
    class: Arc<ClassDefinition>,
    state: DataContainerState,
    slots: Vec<PropertySlot>,
    timestamp: Option<Timestamp>,
}

impl DataContainer {
    /// A container for an object created in this transaction, every property
    /// at its declared default.
    pub fn create_new(id: ObjectId, class: Arc<ClassDefinition>) -> Result<Self, DomainError> {
        check_class(&id, &class)?;
        let slots = class
            .properties
            .iter()
            .map(|p| {
                let value = p.default_value();
                PropertySlot {
                    current: value.clone(),
                    original: value,
                }
            })
            .collect();
        Ok(Self {
            id,
            class,
            state: DataContainerState::New,
            slots,
            timestamp: None,
        })
    }

    /// A container for a loaded object. Properties missing from `values`
    /// take their defaults.
    pub fn create_for_existing(
        id: ObjectId,
        class: Arc<ClassDefinition>,
        timestamp: Timestamp,
        mut values: BTreeMap<String, PropertyValue>,
    ) -> Result<Self, DomainError> {
        check_class(&id, &class)?;
        let mut slots = Vec::with_capacity(class.properties.len());
        for property in &class.properties {
            let value = match values.remove(&property.name) {
                Some(value) => {
                    check_value(&id, property, &value)?;
                    value
                }
                None => property.default_value(),
            };
            slots.push(PropertySlot {
                current: value.clone(),
                original: value,
            });
        }
        if let Some(unknown) = values.keys().next() {
            return Err(DomainError::Argument(format!(
                "Class '{}' has no property '{}' (object '{}').",
                class.id, unknown, id
            )));
        }
        Ok(Self {
            id,
            class,
            state: DataContainerState::Existing,
            slots,
            timestamp: Some(timestamp),
        })
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn class(&self) -> &Arc<ClassDefinition> {
        &self.class
    }

    pub fn state(&self) -> DataContainerState {
        self.state
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    pub fn value(&self, property: &str) -> Result<&PropertyValue, DomainError> {
        self.ensure_readable()?;
        Ok(&self.slot(property)?.current)
    }

    pub fn original_value(&self, property: &str) -> Result<&PropertyValue, DomainError> {
        self.ensure_readable()?;
        Ok(&self.slot(property)?.original)
    }

    /// Current values by property name.
    pub fn values(&self) -> impl Iterator<Item = (&PropertyDefinition, &PropertyValue)> {
        self.class
            .properties
            .iter()
            .zip(self.slots.iter().map(|s| &s.current))
    }

    pub fn to_value_map(&self) -> BTreeMap<String, PropertyValue> {
        self.values()
            .map(|(p, v)| (p.name.clone(), v.clone()))
            .collect()
    }

    pub fn set_value(
        &mut self,
        property: &str,
        value: PropertyValue,
    ) -> Result<Option<StateTransition>, DomainError> {
        if !self.state.is_writable() {
            return Err(DomainError::InvalidOperation(format!(
                "Cannot set property '{}' of object '{}' because it is {:?}.",
                property, self.id, self.state
            )));
        }
        let index = self.index(property)?;
        check_value(&self.id, &self.class.properties[index], &value)?;

        let slot = &mut self.slots[index];
        if slot.current == value {
            return Ok(None);
        }
        slot.current = value;
        Ok(self.transition_if(DataContainerState::Existing, DataContainerState::Changed))
    }

    /// Put an unchanged object into the change set.
    pub fn mark_as_changed(&mut self) -> Result<Option<StateTransition>, DomainError> {
        if !self.state.is_writable() {
            return Err(DomainError::InvalidOperation(format!(
                "Cannot mark object '{}' as changed because it is {:?}.",
                self.id, self.state
            )));
        }
        Ok(self.transition_if(DataContainerState::Existing, DataContainerState::Changed))
    }

    /// `New` objects become `Invalid` right away; loaded ones wait for
    /// commit as `Deleted`.
    pub fn mark_deleted(&mut self) -> Result<Option<StateTransition>, DomainError> {
        match self.state {
            DataContainerState::New => Ok(Some(self.transition(DataContainerState::Invalid))),
            DataContainerState::Existing | DataContainerState::Changed => {
                Ok(Some(self.transition(DataContainerState::Deleted)))
            }
            DataContainerState::Deleted => Ok(None),
            DataContainerState::Discarded | DataContainerState::Invalid => {
                Err(self.invalid_error())
            }
        }
    }

    pub fn commit(&mut self) -> Option<StateTransition> {
        match self.state {
            DataContainerState::New | DataContainerState::Changed => {
                for slot in &mut self.slots {
                    slot.original = slot.current.clone();
                }
                Some(self.transition(DataContainerState::Existing))
            }
            DataContainerState::Deleted => Some(self.transition(DataContainerState::Discarded)),
            _ => None,
        }
    }

    pub fn rollback(&mut self) -> Option<StateTransition> {
        for slot in &mut self.slots {
            slot.current = slot.original.clone();
        }
        match self.state {
            DataContainerState::New => Some(self.transition(DataContainerState::Discarded)),
            DataContainerState::Changed | DataContainerState::Deleted => {
                Some(self.transition(DataContainerState::Existing))
            }
            _ => None,
        }
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = Some(timestamp);
    }

    pub fn has_changed(&self, property: &str) -> Result<bool, DomainError> {
        let slot = self.slot(property)?;
        Ok(slot.current != slot.original)
    }

    /// Copy handed to a sub-transaction: the parent's current state becomes
    /// the child's unchanged original.
    pub fn copy_for_subtransaction(&self) -> DataContainer {
        DataContainer {
            id: self.id.clone(),
            class: self.class.clone(),
            state: DataContainerState::Existing,
            slots: self
                .slots
                .iter()
                .map(|s| PropertySlot {
                    current: s.current.clone(),
                    original: s.current.clone(),
                })
                .collect(),
            timestamp: self.timestamp,
        }
    }

    fn ensure_readable(&self) -> Result<(), DomainError> {
        match self.state {
            DataContainerState::Discarded | DataContainerState::Invalid => Err(self.invalid_error()),
            _ => Ok(()),
        }
    }

    fn invalid_error(&self) -> DomainError {
        let reason = match self.state {
            DataContainerState::Discarded => "discarded",
            _ => "invalid in this transaction",
        };
        DomainError::object_invalid(&self.id, reason)
    }

    fn index(&self, property: &str) -> Result<usize, DomainError> {
        self.class.property_index(property).ok_or_else(|| {
            DomainError::Argument(format!(
                "Class '{}' has no property '{}'.",
                self.class.id, property
            ))
        })
    }

    fn slot(&self, property: &str) -> Result<&PropertySlot, DomainError> {
        Ok(&self.slots[self.index(property)?])
    }

    fn transition(&mut self, to: DataContainerState) -> StateTransition {
        let from = self.state;
        self.state = to;
        StateTransition { from, to }
    }

    fn transition_if(&mut self, from: DataContainerState, to: DataContainerState) -> Option<StateTransition> {
        (self.state == from).then(|| self.transition(to))
    }
}

impl Identified for DataContainer {
    fn object_id(&self) -> &ObjectId {
        &self.id
    }
}

fn check_class(id: &ObjectId, class: &ClassDefinition) -> Result<(), DomainError> {
    if id.class_id() != &class.id {
        return Err(DomainError::Argument(format!(
            "Object '{}' does not belong to class '{}'.",
            id, class.id
        )));
    }
    Ok(())
}

fn check_value(id: &ObjectId, property: &PropertyDefinition, value: &PropertyValue) -> Result<(), DomainError> {
    if property.accepts(value) {
        return Ok(());
    }
    Err(DomainError::Argument(format!(
        "Value {} does not fit property '{}' ({:?}{}) of object '{}'.",
        value,
        property.name,
        property.kind,
        if property.nullable { "" } else { ", not nullable" },
        id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domobj_core::{KeyType, PropertyKind};

    fn class() -> Arc<ClassDefinition> {
        Arc::new(
            ClassDefinition::new("Order", KeyType::Int)
                .with_property(PropertyDefinition::new("OrderNumber", PropertyKind::Int).not_null())
                .with_property(PropertyDefinition::new("Note", PropertyKind::Text)),
        )
    }

    fn existing() -> DataContainer {
        let mut values = BTreeMap::new();
        values.insert("OrderNumber".to_string(), PropertyValue::Int(1));
        DataContainer::create_for_existing(ObjectId::int("Order", 1), class(), Timestamp(7), values).unwrap()
    }

    #[test]
    fn new_container_uses_defaults() {
        let c = DataContainer::create_new(ObjectId::int("Order", 1), class()).unwrap();
        assert_eq!(c.state(), DataContainerState::New);
        assert_eq!(c.value("OrderNumber").unwrap(), &PropertyValue::Int(0));
        assert!(c.value("Note").unwrap().is_null());
        assert_eq!(c.timestamp(), None);
    }

    #[test]
    fn wrong_class_is_rejected() {
        assert!(matches!(
            DataContainer::create_new(ObjectId::int("Customer", 1), class()),
            Err(DomainError::Argument(_))
        ));
    }

    #[test]
    fn unknown_loaded_property_is_rejected() {
        let mut values = BTreeMap::new();
        values.insert("Bogus".to_string(), PropertyValue::Int(1));
        let err = DataContainer::create_for_existing(ObjectId::int("Order", 1), class(), Timestamp(1), values)
            .unwrap_err();
        assert!(err.to_string().contains("Bogus"));
    }

    #[test]
    fn first_write_changes_existing() {
        let mut c = existing();
        let t = c.set_value("Note", "rush".into()).unwrap();
        assert_eq!(
            t,
            Some(StateTransition {
                from: DataContainerState::Existing,
                to: DataContainerState::Changed
            })
        );
        assert_eq!(c.set_value("Note", "later".into()).unwrap(), None);
        assert_eq!(c.state(), DataContainerState::Changed);
        assert!(c.has_changed("Note").unwrap());
        assert!(!c.has_changed("OrderNumber").unwrap());
    }

    #[test]
    fn writing_the_same_value_is_a_no_op() {
        let mut c = existing();
        assert_eq!(c.set_value("OrderNumber", PropertyValue::Int(1)).unwrap(), None);
        assert_eq!(c.state(), DataContainerState::Existing);
    }

    #[test]
    fn new_stays_new_on_write() {
        let mut c = DataContainer::create_new(ObjectId::int("Order", 1), class()).unwrap();
        c.set_value("OrderNumber", PropertyValue::Int(5)).unwrap();
        assert_eq!(c.state(), DataContainerState::New);
    }

    #[test]
    fn kind_and_nullability_checked() {
        let mut c = existing();
        assert!(matches!(
            c.set_value("OrderNumber", "five".into()),
            Err(DomainError::Argument(_))
        ));
        assert!(matches!(
            c.set_value("OrderNumber", PropertyValue::Null),
            Err(DomainError::Argument(_))
        ));
        assert!(matches!(c.set_value("Missing", PropertyValue::Null), Err(DomainError::Argument(_))));
    }

    #[test]
    fn deleted_rejects_writes_but_stays_readable() {
        let mut c = existing();
        c.mark_deleted().unwrap();
        assert_eq!(c.state(), DataContainerState::Deleted);
        assert!(matches!(
            c.set_value("Note", "x".into()),
            Err(DomainError::InvalidOperation(_))
        ));
        assert_eq!(c.value("OrderNumber").unwrap(), &PropertyValue::Int(1));
        assert_eq!(c.mark_deleted().unwrap(), None);
    }

    #[test]
    fn deleting_new_invalidates() {
        let mut c = DataContainer::create_new(ObjectId::int("Order", 1), class()).unwrap();
        c.mark_deleted().unwrap();
        assert_eq!(c.state(), DataContainerState::Invalid);
        assert!(matches!(c.value("Note"), Err(DomainError::ObjectInvalid(_))));
        assert!(matches!(c.mark_deleted(), Err(DomainError::ObjectInvalid(_))));
    }

    #[test]
    fn commit_adopts_current_values() {
        let mut c = DataContainer::create_new(ObjectId::int("Order", 1), class()).unwrap();
        c.set_value("OrderNumber", PropertyValue::Int(9)).unwrap();
        c.commit();
        assert_eq!(c.state(), DataContainerState::Existing);
        assert_eq!(c.value("OrderNumber").unwrap(), &PropertyValue::Int(9));
        assert_eq!(c.original_value("OrderNumber").unwrap(), &PropertyValue::Int(9));

        let mut d = existing();
        d.mark_deleted().unwrap();
        d.commit();
        assert_eq!(d.state(), DataContainerState::Discarded);
    }

    #[test]
    fn rollback_restores_originals() {
        let mut c = existing();
        c.set_value("OrderNumber", PropertyValue::Int(2)).unwrap();
        c.rollback();
        assert_eq!(c.state(), DataContainerState::Existing);
        assert_eq!(c.value("OrderNumber").unwrap(), &PropertyValue::Int(1));

        let mut n = DataContainer::create_new(ObjectId::int("Order", 2), class()).unwrap();
        n.rollback();
        assert_eq!(n.state(), DataContainerState::Discarded);

        let mut d = existing();
        d.mark_deleted().unwrap();
        d.rollback();
        assert_eq!(d.state(), DataContainerState::Existing);
    }

    #[test]
    fn mark_as_changed_without_value_change() {
        let mut c = existing();
        c.mark_as_changed().unwrap();
        assert_eq!(c.state(), DataContainerState::Changed);
        assert!(!c.has_changed("OrderNumber").unwrap());
    }

    #[test]
    fn subtransaction_copy_is_unchanged() {
        let mut c = DataContainer::create_new(ObjectId::int("Order", 1), class()).unwrap();
        c.set_value("Note", "draft".into()).unwrap();
        let copy = c.copy_for_subtransaction();
        assert_eq!(copy.state(), DataContainerState::Existing);
        assert_eq!(copy.original_value("Note").unwrap(), &PropertyValue::from("draft"));
        assert!(!copy.has_changed("Note").unwrap());
    }
}
