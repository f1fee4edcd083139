pub mod config;
pub mod error;
pub mod mapping;
pub mod object_id;
pub mod value;

pub use config::EngineConfig;
pub use error::DomainError;
pub use mapping::{
    Cardinality, ClassDefinition, DuplicatePolicy, EndPointDefinition, EndPointKind,
    IncompleteSync, MappingConfiguration, MappingDocument, MappingLoader, PropertyDefinition,
    RelationDefinition, RelationEndPointDefinition, SortDirection, SortExpression,
};
pub use object_id::{ClassId, KeyType, KeyValue, ObjectId};
pub use value::{PropertyKind, PropertyValue, Timestamp};
