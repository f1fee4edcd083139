use domobj_core::{DomainError, ObjectId};

use super::RelationEndPointId;
use crate::data_container::DataContainer;

/// Foreign-key side of a relation. Holds no state of its own: the opposite
/// id is the `Reference` value in the owning container.
#[derive(Debug, Clone, PartialEq)]
pub struct RealObjectEndPoint {
    id: RelationEndPointId,
}

impl RealObjectEndPoint {
    pub fn new(id: RelationEndPointId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    pub fn opposite_object_id(&self, container: &DataContainer) -> Result<Option<ObjectId>, DomainError> {
        Ok(container.value(&self.id.property)?.as_reference().cloned())
    }

    pub fn original_opposite_object_id(&self, container: &DataContainer) -> Result<Option<ObjectId>, DomainError> {
        Ok(container.original_value(&self.id.property)?.as_reference().cloned())
    }

    pub fn has_changed(&self, container: &DataContainer) -> Result<bool, DomainError> {
        container.has_changed(&self.id.property)
    }
}
