use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::object_id::ObjectId;

/// Declared type of a mapped property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Bool,
    Int,
    Decimal,
    Text,
    Guid,
    DateTime,
    /// Foreign key to another object; always the real side of a relation.
    Reference,
}

impl PropertyKind {
    /// Value a non-nullable property starts with when no default is declared.
    pub fn zero_value(&self) -> PropertyValue {
        match self {
            PropertyKind::Bool => PropertyValue::Bool(false),
            PropertyKind::Int => PropertyValue::Int(0),
            PropertyKind::Decimal => PropertyValue::Decimal(0.0),
            PropertyKind::Text => PropertyValue::Text(String::new()),
            PropertyKind::Guid => PropertyValue::Guid(Uuid::nil()),
            PropertyKind::DateTime => PropertyValue::DateTime(DateTime::<Utc>::default()),
            PropertyKind::Reference => PropertyValue::Null,
        }
    }
}

/// A property value held by a data container or a storage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(f64),
    Text(String),
    Guid(Uuid),
    DateTime(DateTime<Utc>),
    Reference(ObjectId),
}

impl PropertyValue {
    /// Kind of the value; `None` for `Null`, which fits every nullable kind.
    pub fn kind(&self) -> Option<PropertyKind> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(_) => Some(PropertyKind::Bool),
            PropertyValue::Int(_) => Some(PropertyKind::Int),
            PropertyValue::Decimal(_) => Some(PropertyKind::Decimal),
            PropertyValue::Text(_) => Some(PropertyKind::Text),
            PropertyValue::Guid(_) => Some(PropertyKind::Guid),
            PropertyValue::DateTime(_) => Some(PropertyKind::DateTime),
            PropertyValue::Reference(_) => Some(PropertyKind::Reference),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_reference(&self) -> Option<&ObjectId> {
        match self {
            PropertyValue::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Build a foreign-key value; `None` becomes `Null`.
    pub fn reference(target: Option<ObjectId>) -> Self {
        match target {
            Some(id) => PropertyValue::Reference(id),
            None => PropertyValue::Null,
        }
    }

    /// Total order used for sorted collections and query ordering.
    ///
    /// `Null` sorts before everything; values of different kinds order by
    /// kind so the comparison stays total.
    pub fn compare(&self, other: &PropertyValue) -> Ordering {
        use PropertyValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Decimal(a), Decimal(b)) => a.total_cmp(b),
            (Int(a), Decimal(b)) => (*a as f64).total_cmp(b),
            (Decimal(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Guid(a), Guid(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (Reference(a), Reference(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) => 2,
            PropertyValue::Decimal(_) => 3,
            PropertyValue::Text(_) => 4,
            PropertyValue::Guid(_) => 5,
            PropertyValue::DateTime(_) => 6,
            PropertyValue::Reference(_) => 7,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Decimal(d) => write!(f, "{}", d),
            PropertyValue::Text(s) => write!(f, "{:?}", s),
            PropertyValue::Guid(g) => write!(f, "{}", g),
            PropertyValue::DateTime(dt) => f.write_str(&dt.to_rfc3339()),
            PropertyValue::Reference(id) => write!(f, "{}", id),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Decimal(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<ObjectId> for PropertyValue {
    fn from(value: ObjectId) -> Self {
        PropertyValue::Reference(value)
    }
}

/// Optimistic-concurrency token of a stored record.
///
/// Stores bump it on every successful write; commit compares the token a
/// transaction loaded against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const INITIAL: Timestamp = Timestamp(1);

    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
