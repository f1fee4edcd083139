use std::cmp::Ordering;
use std::collections::BTreeSet;

use domobj_core::{DomainError, ObjectId, SortExpression};

use super::RelationEndPointId;

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionState {
    Unloaded,
    Loading {
        known: Vec<ObjectId>,
    },
    /// Some members are known (they were loaded or re-pointed here), the
    /// rest is still in storage.
    Incomplete {
        known: Vec<ObjectId>,
    },
    Complete {
        current: Vec<ObjectId>,
        original: Vec<ObjectId>,
    },
}

/// Many-valued side of a 1:n relation.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEndPoint {
    id: RelationEndPointId,
    sort: Option<SortExpression>,
    state: CollectionState,
}

impl CollectionEndPoint {
    pub fn unloaded(id: RelationEndPointId, sort: Option<SortExpression>) -> Self {
        Self {
            id,
            sort,
            state: CollectionState::Unloaded,
        }
    }

    pub fn complete(id: RelationEndPointId, sort: Option<SortExpression>, members: Vec<ObjectId>) -> Self {
        Self {
            id,
            sort,
            state: CollectionState::Complete {
                current: members.clone(),
                original: members,
            },
        }
    }

    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    pub fn sort(&self) -> Option<&SortExpression> {
        self.sort.as_ref()
    }

    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, CollectionState::Complete { .. })
    }

    /// Enter `Loading`. Returns `false` when the collection is already complete.
    pub fn begin_load(&mut self) -> Result<bool, DomainError> {
        let known = match &mut self.state {
            CollectionState::Unloaded => Vec::new(),
            CollectionState::Incomplete { known } => std::mem::take(known),
            CollectionState::Loading { .. } => {
                return Err(DomainError::InvalidOperation(format!(
                    "End point '{}' is already being loaded.",
                    self.id
                )));
            }
            CollectionState::Complete { .. } => return Ok(false),
        };
        self.state = CollectionState::Loading { known };
        Ok(true)
    }

    /// Members known while loading, in the order they became known.
    pub fn loading_known(&self) -> &[ObjectId] {
        match &self.state {
            CollectionState::Loading { known } => known,
            _ => &[],
        }
    }

    pub fn finish_load(&mut self, current: Vec<ObjectId>, original: Vec<ObjectId>) {
        self.state = CollectionState::Complete { current, original };
    }

    pub fn abort_load(&mut self) {
        if let CollectionState::Loading { known } = &mut self.state {
            let known = std::mem::take(known);
            self.state = if known.is_empty() {
                CollectionState::Unloaded
            } else {
                CollectionState::Incomplete { known }
            };
        }
    }

    /// Members of a complete collection.
    pub fn members(&self) -> Result<&[ObjectId], DomainError> {
        match &self.state {
            CollectionState::Complete { current, .. } => Ok(current),
            _ => Err(DomainError::InvalidOperation(format!(
                "End point '{}' is not complete.",
                self.id
            ))),
        }
    }

    pub fn original_members(&self) -> Option<&[ObjectId]> {
        match &self.state {
            CollectionState::Complete { original, .. } => Some(original),
            _ => None,
        }
    }

    /// Members known so far, whatever the load state.
    pub fn known_members(&self) -> &[ObjectId] {
        match &self.state {
            CollectionState::Complete { current, .. } => current,
            CollectionState::Incomplete { known } | CollectionState::Loading { known } => known,
            CollectionState::Unloaded => &[],
        }
    }

    /// Record that `member` points here. Complete collections only change
    /// through [`add_member`](Self::add_member).
    pub fn note_member(&mut self, member: &ObjectId) {
        match &mut self.state {
            CollectionState::Unloaded => {
                self.state = CollectionState::Incomplete {
                    known: vec![member.clone()],
                };
            }
            CollectionState::Incomplete { known } | CollectionState::Loading { known } => {
                if !known.contains(member) {
                    known.push(member.clone());
                }
            }
            CollectionState::Complete { .. } => {}
        }
    }

    /// Insert `member` at `position` (appended when `None` or out of range).
    pub fn add_member(&mut self, member: ObjectId, position: Option<usize>) {
        match &mut self.state {
            CollectionState::Complete { current, .. } => {
                if current.contains(&member) {
                    return;
                }
                match position {
                    Some(index) if index <= current.len() => current.insert(index, member),
                    _ => current.push(member),
                }
            }
            _ => self.note_member(&member),
        }
    }

    pub fn remove_member(&mut self, member: &ObjectId) {
        match &mut self.state {
            CollectionState::Complete { current, .. } => current.retain(|m| m != member),
            CollectionState::Incomplete { known } | CollectionState::Loading { known } => {
                known.retain(|m| m != member);
            }
            CollectionState::Unloaded => {}
        }
    }

    /// Replace the order of a complete collection. `order` must hold exactly
    /// the current members.
    pub fn set_order(&mut self, order: Vec<ObjectId>) -> Result<(), DomainError> {
        let id = &self.id;
        match &mut self.state {
            CollectionState::Complete { current, .. } => {
                let same = current.len() == order.len()
                    && current.iter().collect::<BTreeSet<_>>() == order.iter().collect::<BTreeSet<_>>();
                if !same {
                    return Err(DomainError::InvalidOperation(format!(
                        "New order of '{}' does not contain the same members.",
                        id
                    )));
                }
                *current = order;
                Ok(())
            }
            _ => Err(DomainError::InvalidOperation(format!(
                "End point '{}' is not complete.",
                id
            ))),
        }
    }

    /// Stable sort of the current members.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&ObjectId, &ObjectId) -> Ordering,
    {
        if let CollectionState::Complete { current, .. } = &mut self.state {
            current.sort_by(compare);
        }
    }

    /// Sorted collections compare membership only; unsorted ones also order.
    pub fn has_changed(&self) -> bool {
        match &self.state {
            CollectionState::Complete { current, original } => {
                if self.sort.is_some() {
                    current.iter().collect::<BTreeSet<_>>() != original.iter().collect::<BTreeSet<_>>()
                } else {
                    current != original
                }
            }
            _ => false,
        }
    }

    pub fn commit(&mut self) {
        if let CollectionState::Complete { current, original } = &mut self.state {
            *original = current.clone();
        }
    }

    /// Complete collections return to their original members; partial
    /// knowledge is dropped and reloaded on demand.
    pub fn rollback(&mut self) {
        match &mut self.state {
            CollectionState::Complete { current, original } => *current = original.clone(),
            CollectionState::Incomplete { .. } => self.state = CollectionState::Unloaded,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: i64) -> ObjectId {
        ObjectId::int("OrderItem", n)
    }

    fn ep(sort: Option<SortExpression>) -> CollectionEndPoint {
        CollectionEndPoint::unloaded(RelationEndPointId::new(ObjectId::int("Order", 1), "OrderItems"), sort)
    }

    #[test]
    fn noted_members_make_it_incomplete() {
        let mut c = ep(None);
        c.note_member(&item(1));
        c.note_member(&item(1));
        assert_eq!(c.state(), &CollectionState::Incomplete { known: vec![item(1)] });
        assert!(c.members().is_err());

        assert!(c.begin_load().unwrap());
        assert_eq!(c.loading_known(), &[item(1)]);
        c.abort_load();
        assert_eq!(c.known_members(), &[item(1)]);
    }

    #[test]
    fn positional_insert_and_remove() {
        let mut c = CollectionEndPoint::complete(
            RelationEndPointId::new(ObjectId::int("Order", 1), "OrderItems"),
            None,
            vec![item(1), item(2)],
        );
        c.add_member(item(3), Some(0));
        c.add_member(item(1), None);
        assert_eq!(c.members().unwrap(), &[item(3), item(1), item(2)]);
        assert!(c.has_changed());

        c.remove_member(&item(3));
        assert!(!c.has_changed());
    }

    #[test]
    fn sorted_collections_ignore_order_changes() {
        let mut c = ep(Some(SortExpression::ascending("Position")));
        c.begin_load().unwrap();
        c.finish_load(vec![item(1), item(2)], vec![item(1), item(2)]);
        c.set_order(vec![item(2), item(1)]).unwrap();
        assert!(!c.has_changed());
        assert!(c.set_order(vec![item(2)]).is_err());
    }

    #[test]
    fn rollback_restores_members() {
        let mut c = ep(None);
        c.begin_load().unwrap();
        c.finish_load(vec![item(1)], vec![item(1)]);
        c.add_member(item(2), None);
        c.rollback();
        assert_eq!(c.members().unwrap(), &[item(1)]);

        let mut partial = ep(None);
        partial.note_member(&item(5));
        partial.rollback();
        assert_eq!(partial.state(), &CollectionState::Unloaded);
    }
}
