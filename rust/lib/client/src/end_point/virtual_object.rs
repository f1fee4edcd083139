use domobj_core::{DomainError, ObjectId};

use super::RelationEndPointId;

#[derive(Debug, Clone, PartialEq)]
pub enum VirtualObjectState {
    Unloaded,
    Loading,
    Complete {
        current: Option<ObjectId>,
        original: Option<ObjectId>,
    },
}

/// Single-valued side of a 1:1 relation without the foreign key.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualObjectEndPoint {
    id: RelationEndPointId,
    state: VirtualObjectState,
}

impl VirtualObjectEndPoint {
    pub fn unloaded(id: RelationEndPointId) -> Self {
        Self {
            id,
            state: VirtualObjectState::Unloaded,
        }
    }

    pub fn complete(id: RelationEndPointId, opposite: Option<ObjectId>) -> Self {
        Self {
            id,
            state: VirtualObjectState::Complete {
                current: opposite.clone(),
                original: opposite,
            },
        }
    }

    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    pub fn state(&self) -> &VirtualObjectState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, VirtualObjectState::Complete { .. })
    }

    /// Enter `Loading`. Returns `false` when there is nothing to load.
    pub fn begin_load(&mut self) -> Result<bool, DomainError> {
        match self.state {
            VirtualObjectState::Unloaded => {
                self.state = VirtualObjectState::Loading;
                Ok(true)
            }
            VirtualObjectState::Loading => Err(DomainError::InvalidOperation(format!(
                "End point '{}' is already being loaded.",
                self.id
            ))),
            VirtualObjectState::Complete { .. } => Ok(false),
        }
    }

    pub fn finish_load(&mut self, current: Option<ObjectId>, original: Option<ObjectId>) {
        self.state = VirtualObjectState::Complete { current, original };
    }

    pub fn abort_load(&mut self) {
        if self.state == VirtualObjectState::Loading {
            self.state = VirtualObjectState::Unloaded;
        }
    }

    pub fn opposite_object_id(&self) -> Result<Option<&ObjectId>, DomainError> {
        match &self.state {
            VirtualObjectState::Complete { current, .. } => Ok(current.as_ref()),
            _ => Err(self.not_loaded()),
        }
    }

    pub fn original_opposite_object_id(&self) -> Result<Option<&ObjectId>, DomainError> {
        match &self.state {
            VirtualObjectState::Complete { original, .. } => Ok(original.as_ref()),
            _ => Err(self.not_loaded()),
        }
    }

    pub fn set_opposite_object_id(&mut self, opposite: Option<ObjectId>) -> Result<(), DomainError> {
        match &mut self.state {
            VirtualObjectState::Complete { current, .. } => {
                *current = opposite;
                Ok(())
            }
            _ => Err(self.not_loaded()),
        }
    }

    pub fn has_changed(&self) -> bool {
        match &self.state {
            VirtualObjectState::Complete { current, original } => current != original,
            _ => false,
        }
    }

    pub fn commit(&mut self) {
        if let VirtualObjectState::Complete { current, original } = &mut self.state {
            *original = current.clone();
        }
    }

    pub fn rollback(&mut self) {
        if let VirtualObjectState::Complete { current, original } = &mut self.state {
            *current = original.clone();
        }
    }

    fn not_loaded(&self) -> DomainError {
        DomainError::InvalidOperation(format!("End point '{}' is not loaded.", self.id))
    }
}
