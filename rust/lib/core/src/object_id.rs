//! Object identities.
//!
//! An [`ObjectId`] pairs a mapped class with a key value. Its string form,
//! `ClassID|KeyValue|KeyValueTypeName`, is the only persisted format the
//! engine owns; it shows up in diagnostics, error messages and as the storage
//! key of the redb backend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a mapped class (e.g. `Order`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(String);

impl ClassId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The key type a class uses for its identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    #[default]
    Guid,
    Text,
    Int,
}

impl KeyType {
    /// Type name used in the string form of an [`ObjectId`].
    pub fn type_name(&self) -> &'static str {
        match self {
            KeyType::Guid => "System.Guid",
            KeyType::Text => "System.String",
            KeyType::Int => "System.Int32",
        }
    }

    fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "System.Guid" => Some(KeyType::Guid),
            "System.String" => Some(KeyType::Text),
            "System.Int32" | "System.Int64" => Some(KeyType::Int),
            _ => None,
        }
    }
}

/// Physical key of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Guid(Uuid),
    Text(String),
    Int(i64),
}

impl KeyValue {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyValue::Guid(_) => KeyType::Guid,
            KeyValue::Text(_) => KeyType::Text,
            KeyValue::Int(_) => KeyType::Int,
        }
    }

    /// Type name of this value in the string form. Integer keys outside the
    /// `i32` range are `System.Int64`.
    pub fn type_name(&self) -> &'static str {
        match self {
            KeyValue::Int(i) if i32::try_from(*i).is_err() => "System.Int64",
            other => other.key_type().type_name(),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Guid(g) => write!(f, "{}", g.hyphenated()),
            KeyValue::Text(s) => f.write_str(s),
            KeyValue::Int(i) => write!(f, "{}", i),
        }
    }
}

/// Immutable identity of a persistent object.
///
/// Equality, ordering and hashing are by value, so an `ObjectId` is the key
/// of every identity map and end-point registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    class_id: ClassId,
    value: KeyValue,
}

impl ObjectId {
    pub fn new(class_id: ClassId, value: KeyValue) -> Self {
        Self { class_id, value }
    }

    pub fn guid(class_id: impl Into<String>, value: Uuid) -> Self {
        Self::new(ClassId::new(class_id), KeyValue::Guid(value))
    }

    pub fn int(class_id: impl Into<String>, value: i64) -> Self {
        Self::new(ClassId::new(class_id), KeyValue::Int(value))
    }

    pub fn text(class_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ClassId::new(class_id), KeyValue::Text(value.into()))
    }

    pub fn class_id(&self) -> &ClassId {
        &self.class_id
    }

    pub fn value(&self) -> &KeyValue {
        &self.value
    }

    /// Prefix shared by the string forms of all ids of `class_id`.
    pub fn class_prefix(class_id: &ClassId) -> String {
        format!("{}|", class_id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.class_id,
            self.value,
            self.value.type_name()
        )
    }
}

impl FromStr for ObjectId {
    type Err = DomainError;

    /// Parse `ClassID|KeyValue|KeyValueTypeName`. The class id ends at the
    /// first separator and the type name starts after the last one, so text
    /// keys may themselves contain `|`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            DomainError::Argument(format!(
                "'{}' is not a valid ObjectID string (expected 'ClassID|KeyValue|TypeName')",
                s
            ))
        };

        let (class_id, rest) = s.split_once('|').ok_or_else(invalid)?;
        let (raw_value, type_name) = rest.rsplit_once('|').ok_or_else(invalid)?;
        if class_id.is_empty() {
            return Err(invalid());
        }

        let value = match KeyType::from_type_name(type_name).ok_or_else(invalid)? {
            KeyType::Guid => KeyValue::Guid(Uuid::parse_str(raw_value).map_err(|e| {
                DomainError::Argument(format!("invalid GUID key '{}': {}", raw_value, e))
            })?),
            KeyType::Int => KeyValue::Int(raw_value.parse().map_err(|e| {
                DomainError::Argument(format!("invalid integer key '{}': {}", raw_value, e))
            })?),
            KeyType::Text => KeyValue::Text(raw_value.to_string()),
        };

        Ok(Self::new(ClassId::new(class_id), value))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_GUID: &str = "5682f032-2f0b-494b-a31c-c97f02b89c36";

    #[test]
    fn display_uses_pipe_separated_form() {
        let id = ObjectId::guid("Order", Uuid::parse_str(ORDER_GUID).unwrap());
        assert_eq!(
            id.to_string(),
            "Order|5682f032-2f0b-494b-a31c-c97f02b89c36|System.Guid"
        );
        assert_eq!(ObjectId::int("Order", 5).to_string(), "Order|5|System.Int32");
        assert_eq!(ObjectId::text("Order", "A-1").to_string(), "Order|A-1|System.String");
    }

    #[test]
    fn wide_integer_keys_name_int64() {
        let id = ObjectId::int("Order", i64::from(i32::MAX) + 1);
        assert_eq!(id.to_string(), "Order|2147483648|System.Int64");
        assert_eq!(id.to_string().parse::<ObjectId>().unwrap(), id);
        assert_eq!(ObjectId::int("Order", -5).to_string(), "Order|-5|System.Int32");
    }

    #[test]
    fn parse_accepts_every_key_type() {
        let id: ObjectId = format!("Order|{}|System.Guid", ORDER_GUID).parse().unwrap();
        assert_eq!(id.class_id().as_str(), "Order");
        assert_eq!(id.value().key_type(), KeyType::Guid);

        let id: ObjectId = "OrderItem|42|System.Int32".parse().unwrap();
        assert_eq!(id, ObjectId::int("OrderItem", 42));
    }

    #[test]
    fn text_keys_may_contain_separator() {
        let id = ObjectId::text("Customer", "a|b");
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert!("Order".parse::<ObjectId>().is_err());
        assert!("Order|5".parse::<ObjectId>().is_err());
        assert!("|5|System.Int32".parse::<ObjectId>().is_err());
        assert!("Order|x|System.Int32".parse::<ObjectId>().is_err());
        assert!("Order|5|System.Decimal".parse::<ObjectId>().is_err());
    }

    #[test]
    fn ordering_groups_by_class_then_key() {
        let mut ids = vec![
            ObjectId::int("OrderItem", 1),
            ObjectId::int("Order", 2),
            ObjectId::int("Order", 1),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ObjectId::int("Order", 1),
                ObjectId::int("Order", 2),
                ObjectId::int("OrderItem", 1),
            ]
        );
    }

    #[test]
    fn serde_uses_string_form() {
        let id = ObjectId::int("Order", 3);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Order|3|System.Int32\"");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
