use std::collections::{HashMap, HashSet};

use domobj_core::{DomainError, ObjectId};
use tracing::{debug, warn};

use super::{Identified, ObjectLookupResult, StorageProviderCommand};

/// Runs a command yielding at most one record and checks it belongs to
/// `expected_id`. No record is not an error here.
pub struct SingleIdAssociateCommand<I> {
    expected_id: ObjectId,
    inner: I,
}

impl<I> SingleIdAssociateCommand<I> {
    pub fn new(expected_id: ObjectId, inner: I) -> Self {
        Self { expected_id, inner }
    }

    pub fn expected_id(&self) -> &ObjectId {
        &self.expected_id
    }
}

impl<C, I, T> StorageProviderCommand<C> for SingleIdAssociateCommand<I>
where
    C: ?Sized,
    I: StorageProviderCommand<C, Output = Option<T>>,
    T: Identified,
{
    type Output = ObjectLookupResult<T>;

    fn execute(&self, context: &C) -> Result<Self::Output, DomainError> {
        let located = self.inner.execute(context)?;
        if let Some(record) = &located {
            if record.object_id() != &self.expected_id {
                return Err(DomainError::Persistence(format!(
                    "The ObjectID of the loaded DataContainer ('{}') and the expected ObjectID ('{}') differ.",
                    record.object_id(),
                    self.expected_id
                )));
            }
        }
        Ok(ObjectLookupResult::new(self.expected_id.clone(), located))
    }
}

/// Runs a command yielding any number of records and lines them up with the
/// requested ids: one result per requested id, in request order.
///
/// Repeated ids get the same record at every position. A record that matches
/// no requested id fails the whole command.
pub struct MultiIdAssociateCommand<I> {
    expected_ids: Vec<ObjectId>,
    inner: I,
}

impl<I> MultiIdAssociateCommand<I> {
    pub fn new(expected_ids: Vec<ObjectId>, inner: I) -> Self {
        Self { expected_ids, inner }
    }

    /// Build from ids that may be absent; any `None` is an argument error.
    pub fn from_optional(expected_ids: Vec<Option<ObjectId>>, inner: I) -> Result<Self, DomainError> {
        let mut ids = Vec::with_capacity(expected_ids.len());
        for (index, id) in expected_ids.into_iter().enumerate() {
            match id {
                Some(id) => ids.push(id),
                None => {
                    return Err(DomainError::Argument(format!(
                        "expected_ids contains a null entry at index {}",
                        index
                    )));
                }
            }
        }
        Ok(Self::new(ids, inner))
    }

    pub fn expected_ids(&self) -> &[ObjectId] {
        &self.expected_ids
    }

    fn orphan_error(&self, orphans: &[ObjectId], matched: &HashMap<ObjectId, impl Sized>) -> DomainError {
        let mut seen = HashSet::new();
        let unsatisfied: Vec<String> = self
            .expected_ids
            .iter()
            .filter(|id| !matched.contains_key(*id) && seen.insert(*id))
            .map(|id| id.to_string())
            .collect();
        let expected = if unsatisfied.is_empty() {
            "none".to_string()
        } else {
            unsatisfied.join(", ")
        };

        let mut message =
            "The ObjectID of one or more loaded DataContainers does not match the expected ObjectIDs:".to_string();
        for orphan in orphans {
            message.push_str(&format!(
                "\nLoaded DataContainer ID: {}, expected ObjectID(s): {}",
                orphan, expected
            ));
        }
        DomainError::Persistence(message)
    }
}

impl<C, I, T> StorageProviderCommand<C> for MultiIdAssociateCommand<I>
where
    C: ?Sized,
    I: StorageProviderCommand<C, Output = Vec<T>>,
    T: Identified + Clone,
{
    type Output = Vec<ObjectLookupResult<T>>;

    fn execute(&self, context: &C) -> Result<Self::Output, DomainError> {
        let records = self.inner.execute(context)?;

        let requested: HashSet<&ObjectId> = self.expected_ids.iter().collect();
        let mut matched: HashMap<ObjectId, T> = HashMap::with_capacity(records.len());
        let mut orphans = Vec::new();

        for record in records {
            let id = record.object_id();
            if !requested.contains(id) {
                orphans.push(id.clone());
            } else if matched.contains_key(id) {
                debug!("MultiIdAssociateCommand: duplicate record for {}, keeping the first", id);
            } else {
                matched.insert(id.clone(), record);
            }
        }

        if !orphans.is_empty() {
            warn!(
                "MultiIdAssociateCommand: {} loaded record(s) match no requested id",
                orphans.len()
            );
            return Err(self.orphan_error(&orphans, &matched));
        }

        Ok(self
            .expected_ids
            .iter()
            .map(|id| ObjectLookupResult::new(id.clone(), matched.get(id).cloned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StorageRecord;
    use domobj_core::Timestamp;

    /// Inner command returning a fixed record list.
    struct Fixed(Vec<StorageRecord>);

    impl StorageProviderCommand<()> for Fixed {
        type Output = Vec<StorageRecord>;

        fn execute(&self, _: &()) -> Result<Self::Output, DomainError> {
            Ok(self.0.clone())
        }
    }

    struct FixedOne(Option<StorageRecord>);

    impl StorageProviderCommand<()> for FixedOne {
        type Output = Option<StorageRecord>;

        fn execute(&self, _: &()) -> Result<Self::Output, DomainError> {
            Ok(self.0.clone())
        }
    }

    fn order(n: i64) -> ObjectId {
        ObjectId::int("Order", n)
    }

    fn record(id: ObjectId) -> StorageRecord {
        StorageRecord::new(id, Timestamp::INITIAL)
    }

    #[test]
    fn single_returns_matching_record() {
        let command = SingleIdAssociateCommand::new(order(1), FixedOne(Some(record(order(1)))));
        let result = command.execute(&()).unwrap();
        assert_eq!(result.object_id, order(1));
        assert!(result.is_found());
    }

    #[test]
    fn single_absence_is_not_an_error() {
        let command = SingleIdAssociateCommand::new(order(1), FixedOne(None));
        let result = command.execute(&()).unwrap();
        assert_eq!(result.object_id, order(1));
        assert!(result.located.is_none());
    }

    #[test]
    fn single_mismatch_names_both_ids() {
        let command = SingleIdAssociateCommand::new(order(1), FixedOne(Some(record(order(2)))));
        let err = command.execute(&()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The ObjectID of the loaded DataContainer ('Order|2|System.Int32') and the expected \
             ObjectID ('Order|1|System.Int32') differ."
        );
        assert!(matches!(err, DomainError::Persistence(_)));
    }

    #[test]
    fn multi_preserves_order_and_cardinality() {
        let command = MultiIdAssociateCommand::new(
            vec![order(1), order(3), ObjectId::int("OrderItem", 1)],
            Fixed(vec![record(order(3)), record(order(1))]),
        );
        let results = command.execute(&()).unwrap();
        let shape: Vec<_> = results.iter().map(|r| (r.object_id.clone(), r.is_found())).collect();
        assert_eq!(
            shape,
            vec![
                (order(1), true),
                (order(3), true),
                (ObjectId::int("OrderItem", 1), false),
            ]
        );
        assert_eq!(results[0].located.as_ref().unwrap().id, order(1));
        assert_eq!(results[1].located.as_ref().unwrap().id, order(3));
    }

    #[test]
    fn multi_replicates_duplicate_requests() {
        let command = MultiIdAssociateCommand::new(vec![order(1), order(1)], Fixed(vec![record(order(1))]));
        let results = command.execute(&()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], results[1]);
        assert!(results[0].is_found());
    }

    #[test]
    fn multi_tolerates_duplicate_records() {
        let command = MultiIdAssociateCommand::new(
            vec![order(1)],
            Fixed(vec![record(order(1)), record(order(1))]),
        );
        assert_eq!(command.execute(&()).unwrap().len(), 1);
    }

    #[test]
    fn multi_orphan_with_everything_satisfied_reports_none() {
        let command = MultiIdAssociateCommand::new(
            vec![order(1)],
            Fixed(vec![record(order(1)), record(order(2))]),
        );
        let err = command.execute(&()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The ObjectID of one or more loaded DataContainers does not match the expected ObjectIDs:\n\
             Loaded DataContainer ID: Order|2|System.Int32, expected ObjectID(s): none"
        );
    }

    #[test]
    fn multi_orphan_lists_unsatisfied_ids() {
        let command = MultiIdAssociateCommand::new(
            vec![order(1), order(3), order(3)],
            Fixed(vec![record(order(2)), record(ObjectId::int("OrderItem", 9))]),
        );
        let message = command.execute(&()).unwrap_err().to_string();
        let lines: Vec<_> = message.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[1],
            "Loaded DataContainer ID: Order|2|System.Int32, expected ObjectID(s): \
             Order|1|System.Int32, Order|3|System.Int32"
        );
        assert!(lines[2].starts_with("Loaded DataContainer ID: OrderItem|9|System.Int32"));
    }

    #[test]
    fn multi_rejects_null_ids() {
        let result = MultiIdAssociateCommand::from_optional(vec![Some(order(1)), None], Fixed(vec![]));
        match result {
            Err(DomainError::Argument(msg)) => assert!(msg.contains("index 1")),
            _ => panic!("expected an argument error"),
        }

        let ok = MultiIdAssociateCommand::from_optional(vec![Some(order(1))], Fixed(vec![])).unwrap();
        assert_eq!(ok.expected_ids(), &[order(1)]);
    }

    #[test]
    fn commands_are_re_executable() {
        let command = MultiIdAssociateCommand::new(vec![order(1)], Fixed(vec![record(order(1))]));
        assert_eq!(command.execute(&()).unwrap(), command.execute(&()).unwrap());
    }
}
