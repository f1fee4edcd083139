pub mod command;
pub mod error;
pub mod memory;
pub mod query;
pub mod record;
pub mod redb_provider;
pub mod traits;

pub use command::{
    DelegateBasedCommand, Identified, MultiIdAssociateCommand, MultipleObjectLoadCommand,
    ObjectLookupResult, QueryCommand, RelatedObjectLoadCommand, SingleIdAssociateCommand,
    SingleObjectLoadCommand, StorageProviderCommand,
};
pub use error::StorageError;
pub use memory::InMemoryStorageProvider;
pub use query::{Filter, FilterOp, Query, QueryRow};
pub use record::{PersistOperation, PersistRecord, StorageRecord};
pub use redb_provider::RedbStorageProvider;
pub use traits::StorageProvider;
