//! Storage provider commands.
//!
//! A command is a stateless, re-executable unit run against a storage
//! execution context `C`. Leaf commands ([`load`]) talk to a
//! [`StorageProvider`](crate::traits::StorageProvider); the associate commands
//! wrap another command and correlate its records with the ids that were
//! asked for. Commands never register anything: the caller owns the results.

mod associate;
mod delegate;
mod load;

use domobj_core::{DomainError, ObjectId};

use crate::record::StorageRecord;

pub use associate::{MultiIdAssociateCommand, SingleIdAssociateCommand};
pub use delegate::DelegateBasedCommand;
pub use load::{MultipleObjectLoadCommand, QueryCommand, RelatedObjectLoadCommand, SingleObjectLoadCommand};

pub trait StorageProviderCommand<C: ?Sized> {
    type Output;

    fn execute(&self, context: &C) -> Result<Self::Output, DomainError>;
}

impl<C: ?Sized, T: StorageProviderCommand<C> + ?Sized> StorageProviderCommand<C> for Box<T> {
    type Output = T::Output;

    fn execute(&self, context: &C) -> Result<Self::Output, DomainError> {
        (**self).execute(context)
    }
}

/// Anything that carries the identity it was loaded for.
pub trait Identified {
    fn object_id(&self) -> &ObjectId;
}

impl Identified for StorageRecord {
    fn object_id(&self) -> &ObjectId {
        &self.id
    }
}

/// Outcome of looking up one requested id.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectLookupResult<T> {
    pub object_id: ObjectId,
    pub located: Option<T>,
}

impl<T> ObjectLookupResult<T> {
    pub fn new(object_id: ObjectId, located: Option<T>) -> Self {
        Self { object_id, located }
    }

    pub fn is_found(&self) -> bool {
        self.located.is_some()
    }
}
