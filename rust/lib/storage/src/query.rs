use std::cmp::Ordering;
use std::collections::BTreeMap;

use domobj_core::{ClassId, PropertyValue, SortDirection, SortExpression};
use serde::{Deserialize, Serialize};

use crate::record::StorageRecord;

static NULL: PropertyValue = PropertyValue::Null;

/// An anonymous result row: selected columns plus `id`.
pub type QueryRow = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Ne => ordering != Ordering::Equal,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Le => ordering != Ordering::Greater,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property: String,
    pub op: FilterOp,
    pub value: PropertyValue,
}

/// Query over the records of one class.
///
/// Filters are ANDed; a property missing from a record compares as `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub class_id: ClassId,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<SortExpression>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(class_id: impl Into<String>) -> Self {
        Self {
            class_id: ClassId::new(class_id),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, property: impl Into<String>, op: FilterOp, value: impl Into<PropertyValue>) -> Self {
        self.filters.push(Filter {
            property: property.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, sort: SortExpression) -> Self {
        self.order_by.push(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &StorageRecord) -> bool {
        if record.id.class_id() != &self.class_id {
            return false;
        }
        self.filters.iter().all(|f| {
            let value = record.value(&f.property).unwrap_or(&NULL);
            f.op.holds(value.compare(&f.value))
        })
    }

    /// Filter, order and limit `records`. Ties keep their input order.
    pub fn apply(&self, records: impl IntoIterator<Item = StorageRecord>) -> Vec<StorageRecord> {
        let mut matched: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        if !self.order_by.is_empty() {
            matched.sort_by(|a, b| self.compare(a, b));
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }

    fn compare(&self, a: &StorageRecord, b: &StorageRecord) -> Ordering {
        for sort in &self.order_by {
            let left = a.value(&sort.property).unwrap_or(&NULL);
            let right = b.value(&sort.property).unwrap_or(&NULL);
            let ordering = match sort.direction {
                SortDirection::Ascending => left.compare(right),
                SortDirection::Descending => right.compare(left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Project a record onto `columns` (every value when empty).
pub fn to_row(record: &StorageRecord, columns: &[String]) -> QueryRow {
    let mut row: QueryRow = if columns.is_empty() {
        record.values.clone()
    } else {
        columns
            .iter()
            .map(|c| (c.clone(), record.value(c).cloned().unwrap_or(PropertyValue::Null)))
            .collect()
    };
    row.insert("id".to_string(), PropertyValue::Reference(record.id.clone()));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use domobj_core::{ObjectId, Timestamp};

    fn order(n: i64, number: i64, customer: Option<&str>) -> StorageRecord {
        let mut record = StorageRecord::new(ObjectId::int("Order", n), Timestamp::INITIAL)
            .with_value("OrderNumber", number);
        if let Some(name) = customer {
            record = record.with_value("CustomerName", name);
        }
        record
    }

    fn fixture() -> Vec<StorageRecord> {
        vec![
            order(1, 30, Some("b")),
            order(2, 10, Some("a")),
            order(3, 20, None),
            StorageRecord::new(ObjectId::int("OrderItem", 1), Timestamp::INITIAL),
        ]
    }

    #[test]
    fn filters_by_class_and_value() {
        let query = Query::new("Order").filter("OrderNumber", FilterOp::Ge, 20i64);
        let ids: Vec<_> = query.apply(fixture()).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ObjectId::int("Order", 1), ObjectId::int("Order", 3)]);
    }

    #[test]
    fn missing_values_compare_as_null() {
        let query = Query::new("Order").filter("CustomerName", FilterOp::Eq, PropertyValue::Null);
        let ids: Vec<_> = query.apply(fixture()).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ObjectId::int("Order", 3)]);
    }

    #[test]
    fn orders_and_limits() {
        let query = Query::new("Order")
            .order_by(SortExpression::descending("OrderNumber"))
            .limit(2);
        let numbers: Vec<_> = query
            .apply(fixture())
            .into_iter()
            .map(|r| r.values["OrderNumber"].clone())
            .collect();
        assert_eq!(numbers, vec![PropertyValue::Int(30), PropertyValue::Int(20)]);
    }

    #[test]
    fn row_projection() {
        let record = order(1, 30, Some("b"));
        let row = to_row(&record, &["OrderNumber".to_string(), "Missing".to_string()]);
        assert_eq!(row.len(), 3);
        assert_eq!(row["OrderNumber"], PropertyValue::Int(30));
        assert!(row["Missing"].is_null());
        assert_eq!(row["id"], PropertyValue::Reference(ObjectId::int("Order", 1)));

        assert_eq!(to_row(&record, &[]).len(), 3);
    }
}
