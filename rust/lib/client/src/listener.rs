use std::cell::RefCell;
use std::rc::Rc;

use domobj_core::{ObjectId, PropertyValue};

use crate::data_container::StateTransition;
use crate::end_point::RelationEndPointId;
use crate::transaction::TransactionId;

/// Something observable that happened inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    ObjectsLoaded(Vec<ObjectId>),
    NewObject(ObjectId),
    PropertyChanged {
        object_id: ObjectId,
        property: String,
        old: PropertyValue,
        new: PropertyValue,
    },
    RelationChanged(RelationEndPointId),
    ObjectDeleted(ObjectId),
    StateChanged {
        object_id: ObjectId,
        transition: StateTransition,
    },
    Committing(Vec<ObjectId>),
    Committed(Vec<ObjectId>),
    RolledBack(Vec<ObjectId>),
    SubTransactionCreated(TransactionId),
    Discarded,
}

/// Receives the events of one transaction, in order, after the operation
/// that raised them finished.
pub trait TransactionListener {
    fn on_event(&mut self, transaction: TransactionId, event: &TransactionEvent);
}

impl<L: TransactionListener> TransactionListener for Rc<RefCell<L>> {
    fn on_event(&mut self, transaction: TransactionId, event: &TransactionEvent) {
        self.borrow_mut().on_event(transaction, event);
    }
}

/// Listener that keeps every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Vec<(TransactionId, TransactionEvent)>,
}

impl TransactionListener for RecordingListener {
    fn on_event(&mut self, transaction: TransactionId, event: &TransactionEvent) {
        self.events.push((transaction, event.clone()));
    }
}
