//! Client-side unit of work: identity map, change tracking, lazily loaded
//! bidirectional relations and nested transactions over a storage provider.

pub mod data_container;
pub mod data_manager;
pub mod end_point;
pub mod listener;
pub mod persistence;
pub mod scope;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use data_container::{DataContainer, DataContainerState, StateTransition};
pub use data_manager::{ChangeSet, DataManager};
pub use end_point::{
    CollectionEndPoint, CollectionState, RealObjectEndPoint, RelationEndPoint, RelationEndPointId,
    VirtualObjectEndPoint, VirtualObjectState,
};
pub use listener::{RecordingListener, TransactionEvent, TransactionListener};
pub use persistence::{PersistenceStrategy, RootPersistenceStrategy};
pub use scope::{ScopeGuard, ScopeStack};
pub use transaction::{ClientTransaction, TransactionId, TransactionState};
