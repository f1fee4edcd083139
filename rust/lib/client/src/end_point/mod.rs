//! Relation end points.
//!
//! Every relation has a real side, whose foreign key lives in the owning
//! data container, and a virtual side that is loaded on demand. Virtual end
//! points make their load state explicit instead of loading behind the
//! caller's back; the data manager drives `begin_load`/`finish_load`.

mod collection;
mod real_object;
mod virtual_object;

use std::fmt;

use domobj_core::{EndPointKind, ObjectId, RelationEndPointDefinition};

pub use collection::{CollectionEndPoint, CollectionState};
pub use real_object::RealObjectEndPoint;
pub use virtual_object::{VirtualObjectEndPoint, VirtualObjectState};

/// Identifies one side of a relation on one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationEndPointId {
    pub object_id: ObjectId,
    pub property: String,
}

impl RelationEndPointId {
    pub fn new(object_id: ObjectId, property: impl Into<String>) -> Self {
        Self {
            object_id,
            property: property.into(),
        }
    }
}

impl fmt::Display for RelationEndPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.object_id, self.property)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelationEndPoint {
    RealObject(RealObjectEndPoint),
    VirtualObject(VirtualObjectEndPoint),
    Collection(CollectionEndPoint),
}

impl RelationEndPoint {
    /// A not-yet-loaded end point for `definition`.
    pub fn unloaded(id: RelationEndPointId, definition: &RelationEndPointDefinition) -> Self {
        match definition.kind {
            EndPointKind::RealObject => RelationEndPoint::RealObject(RealObjectEndPoint::new(id)),
            EndPointKind::VirtualObject => {
                RelationEndPoint::VirtualObject(VirtualObjectEndPoint::unloaded(id))
            }
            EndPointKind::Collection => RelationEndPoint::Collection(CollectionEndPoint::unloaded(
                id,
                definition.sort.clone(),
            )),
        }
    }

    /// End point of an object created in this transaction: nothing points at
    /// it yet, so it starts complete and empty.
    pub fn empty(id: RelationEndPointId, definition: &RelationEndPointDefinition) -> Self {
        match definition.kind {
            EndPointKind::RealObject => RelationEndPoint::RealObject(RealObjectEndPoint::new(id)),
            EndPointKind::VirtualObject => {
                RelationEndPoint::VirtualObject(VirtualObjectEndPoint::complete(id, None))
            }
            EndPointKind::Collection => RelationEndPoint::Collection(CollectionEndPoint::complete(
                id,
                definition.sort.clone(),
                Vec::new(),
            )),
        }
    }

    pub fn id(&self) -> &RelationEndPointId {
        match self {
            RelationEndPoint::RealObject(ep) => ep.id(),
            RelationEndPoint::VirtualObject(ep) => ep.id(),
            RelationEndPoint::Collection(ep) => ep.id(),
        }
    }

    pub fn kind(&self) -> EndPointKind {
        match self {
            RelationEndPoint::RealObject(_) => EndPointKind::RealObject,
            RelationEndPoint::VirtualObject(_) => EndPointKind::VirtualObject,
            RelationEndPoint::Collection(_) => EndPointKind::Collection,
        }
    }

    /// Real end points are complete whenever their container is loaded.
    pub fn is_complete(&self) -> bool {
        match self {
            RelationEndPoint::RealObject(_) => true,
            RelationEndPoint::VirtualObject(ep) => ep.is_complete(),
            RelationEndPoint::Collection(ep) => ep.is_complete(),
        }
    }

    /// Change tracking of virtual end points; real ones report through their
    /// container's foreign key.
    pub fn has_changed(&self) -> bool {
        match self {
            RelationEndPoint::RealObject(_) => false,
            RelationEndPoint::VirtualObject(ep) => ep.has_changed(),
            RelationEndPoint::Collection(ep) => ep.has_changed(),
        }
    }

    pub fn commit(&mut self) {
        match self {
            RelationEndPoint::RealObject(_) => {}
            RelationEndPoint::VirtualObject(ep) => ep.commit(),
            RelationEndPoint::Collection(ep) => ep.commit(),
        }
    }

    pub fn rollback(&mut self) {
        match self {
            RelationEndPoint::RealObject(_) => {}
            RelationEndPoint::VirtualObject(ep) => ep.rollback(),
            RelationEndPoint::Collection(ep) => ep.rollback(),
        }
    }

    pub fn as_virtual_object_mut(&mut self) -> Option<&mut VirtualObjectEndPoint> {
        match self {
            RelationEndPoint::VirtualObject(ep) => Some(ep),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionEndPoint> {
        match self {
            RelationEndPoint::Collection(ep) => Some(ep),
            _ => None,
        }
    }

    pub fn as_collection_mut(&mut self) -> Option<&mut CollectionEndPoint> {
        match self {
            RelationEndPoint::Collection(ep) => Some(ep),
            _ => None,
        }
    }

    pub fn as_virtual_object(&self) -> Option<&VirtualObjectEndPoint> {
        match self {
            RelationEndPoint::VirtualObject(ep) => Some(ep),
            _ => None,
        }
    }
}
