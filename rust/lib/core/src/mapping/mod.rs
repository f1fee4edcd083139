//! Static mapping descriptors.
//!
//! A [`MappingConfiguration`] is built once at startup (usually by the
//! [`MappingLoader`]) and is read-only afterwards. Construction validates the
//! whole snapshot and flattens every relation into per-class end point
//! definitions, so the engine never has to re-derive which side of a relation
//! holds the foreign key.

mod loader;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::object_id::{ClassId, KeyType, ObjectId};
use crate::value::{PropertyKind, PropertyValue};

pub use loader::MappingLoader;

fn default_true() -> bool {
    true
}

/// One stored property of a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    pub kind: PropertyKind,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<PropertyValue>,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Value of the property in a freshly created object.
    pub fn default_value(&self) -> PropertyValue {
        match &self.default {
            Some(value) => value.clone(),
            None if self.nullable => PropertyValue::Null,
            None => self.kind.zero_value(),
        }
    }

    /// Whether `value` may be stored in this property.
    ///
    /// References accept `Null` even when not nullable; a missing mandatory
    /// relation is reported at commit time instead.
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        match value.kind() {
            None => self.nullable || self.kind == PropertyKind::Reference,
            Some(kind) => kind == self.kind,
        }
    }
}

/// A mapped class and its stored properties, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDefinition {
    pub id: ClassId,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl ClassDefinition {
    pub fn new(id: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            id: ClassId::new(id),
            key_type,
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Sort key of a collection end point or a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortExpression {
    pub property: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortExpression {
    pub fn ascending(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// What adding an element that is already part of a collection does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail with an invalid-operation error.
    #[default]
    Reject,
    /// Leave the collection untouched.
    Ignore,
}

/// How a collection that is not completely loaded reacts to changes made
/// through the foreign-key side of its relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteSync {
    /// Apply the change to the known members only; no storage round-trip.
    #[default]
    Defer,
    /// Load the complete collection before applying the change.
    LoadFirst,
}

/// One side of a relation as declared in the mapping file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndPointDefinition {
    pub class: ClassId,
    pub property: String,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub sort: Option<SortExpression>,
}

/// A bidirectional relation between two classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub id: String,
    pub end_points: [EndPointDefinition; 2],
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    pub incomplete_sync: IncompleteSync,
}

/// Resolved shape of a relation end point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndPointKind {
    /// Holds the foreign key in the owning object's data.
    RealObject,
    /// Single-valued side without a foreign key (1:1).
    VirtualObject,
    /// Many-valued side without a foreign key (1:n).
    Collection,
}

/// Flattened view of one relation end point, including its opposite side.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationEndPointDefinition {
    pub relation_id: String,
    pub class_id: ClassId,
    pub property: String,
    pub kind: EndPointKind,
    pub sort: Option<SortExpression>,
    pub mandatory: bool,
    pub duplicate_policy: DuplicatePolicy,
    pub incomplete_sync: IncompleteSync,
    pub opposite_class_id: ClassId,
    pub opposite_property: String,
    pub opposite_kind: EndPointKind,
}

impl RelationEndPointDefinition {
    pub fn is_virtual(&self) -> bool {
        self.kind != EndPointKind::RealObject
    }
}

/// Mapping file contents before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingDocument {
    #[serde(default)]
    pub classes: Vec<ClassDefinition>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
}

/// Validated, read-only mapping snapshot.
#[derive(Debug)]
pub struct MappingConfiguration {
    classes: BTreeMap<ClassId, Arc<ClassDefinition>>,
    relations: Vec<RelationDefinition>,
    end_points: BTreeMap<ClassId, BTreeMap<String, RelationEndPointDefinition>>,
}

impl MappingConfiguration {
    /// Validate `document` and build the snapshot.
    pub fn new(document: MappingDocument) -> Result<Self, DomainError> {
        let mut classes = BTreeMap::new();
        for class in document.classes {
            validate_class(&class)?;
            let id = class.id.clone();
            if classes.insert(id.clone(), Arc::new(class)).is_some() {
                return Err(DomainError::Mapping(format!("class '{}' is defined twice", id)));
            }
        }

        let mut end_points: BTreeMap<ClassId, BTreeMap<String, RelationEndPointDefinition>> =
            BTreeMap::new();
        let mut relation_ids = BTreeSet::new();

        for relation in &document.relations {
            if !relation_ids.insert(relation.id.clone()) {
                return Err(DomainError::Mapping(format!(
                    "relation '{}' is defined twice",
                    relation.id
                )));
            }
            let [left, right] = resolve_relation(&classes, relation)?;
            for resolved in [left, right] {
                let per_class = end_points.entry(resolved.class_id.clone()).or_default();
                if per_class.contains_key(&resolved.property) {
                    return Err(DomainError::Mapping(format!(
                        "property '{}.{}' takes part in more than one relation",
                        resolved.class_id, resolved.property
                    )));
                }
                per_class.insert(resolved.property.clone(), resolved);
            }
        }

        // Every foreign key must belong to a relation.
        for class in classes.values() {
            for property in &class.properties {
                let related = end_points
                    .get(&class.id)
                    .is_some_and(|eps| eps.contains_key(&property.name));
                if property.kind == PropertyKind::Reference && !related {
                    return Err(DomainError::Mapping(format!(
                        "reference property '{}.{}' is not part of any relation",
                        class.id, property.name
                    )));
                }
            }
        }

        Ok(Self {
            classes,
            relations: document.relations,
            end_points,
        })
    }

    /// Parse and validate a TOML mapping document.
    pub fn from_toml_str(content: &str) -> Result<Self, DomainError> {
        let document: MappingDocument = toml::from_str(content)
            .map_err(|e| DomainError::Mapping(format!("invalid mapping document: {}", e)))?;
        Self::new(document)
    }

    pub fn class(&self, id: &ClassId) -> Result<&Arc<ClassDefinition>, DomainError> {
        self.classes
            .get(id)
            .ok_or_else(|| DomainError::Mapping(format!("class '{}' is not mapped", id)))
    }

    /// Class definition of the object `id` refers to.
    pub fn class_of(&self, id: &ObjectId) -> Result<&Arc<ClassDefinition>, DomainError> {
        self.class(id.class_id())
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassDefinition>> {
        self.classes.values()
    }

    pub fn relations(&self) -> &[RelationDefinition] {
        &self.relations
    }

    /// End point definition of `class.property`, if the property is relational.
    pub fn end_point(&self, class: &ClassId, property: &str) -> Option<&RelationEndPointDefinition> {
        self.end_points.get(class).and_then(|eps| eps.get(property))
    }

    /// Like [`end_point`](Self::end_point) but fails for non-relation properties.
    pub fn require_end_point(
        &self,
        class: &ClassId,
        property: &str,
    ) -> Result<&RelationEndPointDefinition, DomainError> {
        self.end_point(class, property).ok_or_else(|| {
            DomainError::Argument(format!(
                "property '{}.{}' is not a relation end point",
                class, property
            ))
        })
    }

    /// Opposite side of `definition`.
    pub fn opposite(
        &self,
        definition: &RelationEndPointDefinition,
    ) -> Result<&RelationEndPointDefinition, DomainError> {
        self.end_point(&definition.opposite_class_id, &definition.opposite_property)
            .ok_or_else(|| {
                DomainError::Mapping(format!(
                    "relation '{}' has no opposite end point for '{}.{}'",
                    definition.relation_id, definition.class_id, definition.property
                ))
            })
    }

    /// All relation end points of a class, ordered by property name.
    pub fn end_points_of(&self, class: &ClassId) -> Vec<&RelationEndPointDefinition> {
        self.end_points
            .get(class)
            .map(|eps| eps.values().collect())
            .unwrap_or_default()
    }
}

fn validate_class(class: &ClassDefinition) -> Result<(), DomainError> {
    let id = class.id.as_str();
    if id.is_empty() || id.contains('|') {
        return Err(DomainError::Mapping(format!(
            "class id '{}' must be non-empty and must not contain '|'",
            id
        )));
    }

    let mut names = BTreeSet::new();
    for property in &class.properties {
        if property.name.is_empty() {
            return Err(DomainError::Mapping(format!("class '{}' has an unnamed property", id)));
        }
        if !names.insert(property.name.as_str()) {
            return Err(DomainError::Mapping(format!(
                "property '{}.{}' is defined twice",
                id, property.name
            )));
        }
        if let Some(default) = &property.default {
            if property.kind == PropertyKind::Reference {
                return Err(DomainError::Mapping(format!(
                    "reference property '{}.{}' cannot declare a default",
                    id, property.name
                )));
            }
            if !property.accepts(default) {
                return Err(DomainError::Mapping(format!(
                    "default value {} does not fit property '{}.{}' of kind {:?}",
                    default, id, property.name, property.kind
                )));
            }
        }
    }
    Ok(())
}

fn resolve_relation(
    classes: &BTreeMap<ClassId, Arc<ClassDefinition>>,
    relation: &RelationDefinition,
) -> Result<[RelationEndPointDefinition; 2], DomainError> {
    let mut real = [false; 2];
    let mut mandatory = [false; 2];

    for (side, ep) in relation.end_points.iter().enumerate() {
        let class = classes.get(&ep.class).ok_or_else(|| {
            DomainError::Mapping(format!(
                "relation '{}' refers to unknown class '{}'",
                relation.id, ep.class
            ))
        })?;
        if let Some(property) = class.property(&ep.property) {
            if property.kind != PropertyKind::Reference {
                return Err(DomainError::Mapping(format!(
                    "relation '{}': property '{}.{}' must be a reference",
                    relation.id, ep.class, ep.property
                )));
            }
            real[side] = true;
            mandatory[side] = !property.nullable;
        }
    }

    let real_side = match real {
        [true, false] => 0,
        [false, true] => 1,
        _ => {
            return Err(DomainError::Mapping(format!(
                "relation '{}' needs exactly one end point backed by a reference property",
                relation.id
            )));
        }
    };
    let virtual_side = 1 - real_side;

    let real_ep = &relation.end_points[real_side];
    let virtual_ep = &relation.end_points[virtual_side];
    if real_ep.cardinality != Cardinality::One {
        return Err(DomainError::Mapping(format!(
            "relation '{}': the foreign-key side '{}.{}' must have cardinality 'one'",
            relation.id, real_ep.class, real_ep.property
        )));
    }
    if real_ep.sort.is_some() || (virtual_ep.sort.is_some() && virtual_ep.cardinality == Cardinality::One) {
        return Err(DomainError::Mapping(format!(
            "relation '{}': only collection end points can declare a sort expression",
            relation.id
        )));
    }
    if let Some(sort) = &virtual_ep.sort {
        // Collection members are instances of the foreign-key side's class.
        let member_class = &classes[&real_ep.class];
        if member_class.property(&sort.property).is_none() {
            return Err(DomainError::Mapping(format!(
                "relation '{}': sort property '{}.{}' does not exist",
                relation.id, real_ep.class, sort.property
            )));
        }
    }

    let virtual_kind = match virtual_ep.cardinality {
        Cardinality::One => EndPointKind::VirtualObject,
        Cardinality::Many => EndPointKind::Collection,
    };

    let build = |ep: &EndPointDefinition,
                 kind: EndPointKind,
                 mandatory: bool,
                 opposite: &EndPointDefinition,
                 opposite_kind: EndPointKind| RelationEndPointDefinition {
        relation_id: relation.id.clone(),
        class_id: ep.class.clone(),
        property: ep.property.clone(),
        kind,
        sort: ep.sort.clone(),
        mandatory,
        duplicate_policy: relation.duplicate_policy,
        incomplete_sync: relation.incomplete_sync,
        opposite_class_id: opposite.class.clone(),
        opposite_property: opposite.property.clone(),
        opposite_kind,
    };

    Ok([
        build(
            real_ep,
            EndPointKind::RealObject,
            mandatory[real_side],
            virtual_ep,
            virtual_kind,
        ),
        build(virtual_ep, virtual_kind, false, real_ep, EndPointKind::RealObject),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_MAPPING: &str = r#"
        [[classes]]
        id = "Order"
        key_type = "int"
        properties = [
            { name = "OrderNumber", kind = "int", nullable = false },
            { name = "Customer", kind = "reference" },
        ]

        [[classes]]
        id = "Customer"
        properties = [{ name = "Name", kind = "text", default = { type = "text", value = "anonymous" } }]

        [[classes]]
        id = "OrderItem"
        properties = [
            { name = "Position", kind = "int" },
            { name = "Order", kind = "reference", nullable = false },
        ]

        [[relations]]
        id = "Customer:Orders"
        end_points = [
            { class = "Customer", property = "Orders", cardinality = "many" },
            { class = "Order", property = "Customer", cardinality = "one" },
        ]

        [[relations]]
        id = "Order:OrderItems"
        duplicate_policy = "ignore"
        incomplete_sync = "load_first"
        end_points = [
            { class = "Order", property = "OrderItems", cardinality = "many", sort = { property = "Position", direction = "descending" } },
            { class = "OrderItem", property = "Order", cardinality = "one" },
        ]
    "#;

    #[test]
    fn resolves_both_sides_of_a_relation() {
        let mapping = MappingConfiguration::from_toml_str(ORDER_MAPPING).unwrap();

        let items = mapping.end_point(&ClassId::new("Order"), "OrderItems").unwrap();
        assert_eq!(items.kind, EndPointKind::Collection);
        assert_eq!(items.opposite_property, "Order");
        assert_eq!(items.duplicate_policy, DuplicatePolicy::Ignore);
        assert_eq!(items.incomplete_sync, IncompleteSync::LoadFirst);
        assert_eq!(items.sort, Some(SortExpression::descending("Position")));

        let order = mapping.opposite(items).unwrap();
        assert_eq!(order.kind, EndPointKind::RealObject);
        assert!(order.mandatory);
        assert_eq!(order.opposite_kind, EndPointKind::Collection);

        let customer = mapping.end_point(&ClassId::new("Order"), "Customer").unwrap();
        assert!(!customer.mandatory);
        assert!(mapping.end_point(&ClassId::new("Order"), "OrderNumber").is_none());
    }

    #[test]
    fn end_points_of_lists_every_relation_property() {
        let mapping = MappingConfiguration::from_toml_str(ORDER_MAPPING).unwrap();
        let names: Vec<_> = mapping
            .end_points_of(&ClassId::new("Order"))
            .into_iter()
            .map(|ep| ep.property.as_str())
            .collect();
        assert_eq!(names, vec!["Customer", "OrderItems"]);
    }

    #[test]
    fn property_defaults() {
        let mapping = MappingConfiguration::from_toml_str(ORDER_MAPPING).unwrap();
        let order = mapping.class(&ClassId::new("Order")).unwrap();
        assert_eq!(order.key_type, KeyType::Int);
        assert_eq!(order.property("OrderNumber").unwrap().default_value(), PropertyValue::Int(0));
        assert!(order.property("Customer").unwrap().default_value().is_null());

        let customer = mapping.class(&ClassId::new("Customer")).unwrap();
        assert_eq!(
            customer.property("Name").unwrap().default_value(),
            PropertyValue::from("anonymous")
        );
    }

    #[test]
    fn accepts_checks_kind_and_nullability() {
        let number = PropertyDefinition::new("Number", PropertyKind::Int).not_null();
        assert!(number.accepts(&PropertyValue::Int(1)));
        assert!(!number.accepts(&PropertyValue::Null));
        assert!(!number.accepts(&PropertyValue::from("1")));

        let fk = PropertyDefinition::new("Order", PropertyKind::Reference).not_null();
        assert!(fk.accepts(&PropertyValue::Null));
    }

    #[test]
    fn rejects_duplicate_class() {
        let doc = MappingDocument {
            classes: vec![
                ClassDefinition::new("Order", KeyType::Guid),
                ClassDefinition::new("Order", KeyType::Int),
            ],
            relations: vec![],
        };
        let err = MappingConfiguration::new(doc).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn rejects_class_id_with_separator() {
        let doc = MappingDocument {
            classes: vec![ClassDefinition::new("Or|der", KeyType::Guid)],
            relations: vec![],
        };
        assert!(matches!(MappingConfiguration::new(doc), Err(DomainError::Mapping(_))));
    }

    #[test]
    fn rejects_dangling_reference_property() {
        let doc = MappingDocument {
            classes: vec![ClassDefinition::new("Order", KeyType::Guid)
                .with_property(PropertyDefinition::new("Customer", PropertyKind::Reference))],
            relations: vec![],
        };
        let err = MappingConfiguration::new(doc).unwrap_err();
        assert!(err.to_string().contains("not part of any relation"));
    }

    #[test]
    fn rejects_relation_without_foreign_key() {
        let doc = MappingDocument {
            classes: vec![
                ClassDefinition::new("A", KeyType::Guid),
                ClassDefinition::new("B", KeyType::Guid),
            ],
            relations: vec![RelationDefinition {
                id: "A:B".into(),
                end_points: [
                    EndPointDefinition {
                        class: ClassId::new("A"),
                        property: "B".into(),
                        cardinality: Cardinality::One,
                        sort: None,
                    },
                    EndPointDefinition {
                        class: ClassId::new("B"),
                        property: "A".into(),
                        cardinality: Cardinality::One,
                        sort: None,
                    },
                ],
                duplicate_policy: DuplicatePolicy::Reject,
                incomplete_sync: IncompleteSync::Defer,
            }],
        };
        let err = MappingConfiguration::new(doc).unwrap_err();
        assert!(err.to_string().contains("exactly one end point"));
    }

    #[test]
    fn rejects_unknown_sort_property() {
        let broken = ORDER_MAPPING.replace(
            "sort = { property = \"Position\", direction = \"descending\" }",
            "sort = { property = \"Missing\" }",
        );
        let err = MappingConfiguration::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("sort property"));
    }

    #[test]
    fn rejects_bad_default() {
        let doc = MappingDocument {
            classes: vec![ClassDefinition::new("A", KeyType::Guid).with_property(PropertyDefinition {
                name: "Count".into(),
                kind: PropertyKind::Int,
                nullable: true,
                default: Some(PropertyValue::from("three")),
            })],
            relations: vec![],
        };
        assert!(MappingConfiguration::new(doc).is_err());
    }
}
