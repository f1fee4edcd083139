//! Shared fixtures: an order-management mapping and a seeded store.

use std::sync::Arc;

use domobj_core::{MappingConfiguration, ObjectId, Timestamp};
use domobj_storage::{InMemoryStorageProvider, StorageRecord};
use uuid::Uuid;

use crate::transaction::ClientTransaction;

pub const ORDER_CLASSES: &str = r#"
    [[classes]]
    id = "Customer"
    key_type = "guid"
    properties = [{ name = "Name", kind = "text" }]

    [[classes]]
    id = "Order"
    key_type = "int"
    properties = [
        { name = "OrderNumber", kind = "int", nullable = false },
        { name = "Customer", kind = "reference" },
    ]

    [[classes]]
    id = "OrderItem"
    key_type = "int"
    properties = [
        { name = "Position", kind = "int", nullable = false },
        { name = "Product", kind = "text" },
        { name = "Order", kind = "reference" },
    ]

    [[classes]]
    id = "OrderTicket"
    key_type = "int"
    properties = [
        { name = "FileName", kind = "text" },
        { name = "Order", kind = "reference", nullable = false },
    ]
"#;

pub const ORDER_RELATIONS: &str = r#"
    [[relations]]
    id = "Customer:Orders"
    end_points = [
        { class = "Customer", property = "Orders", cardinality = "many" },
        { class = "Order", property = "Customer", cardinality = "one" },
    ]

    [[relations]]
    id = "Order:OrderItems"
    end_points = [
        { class = "Order", property = "OrderItems", cardinality = "many", sort = { property = "Position" } },
        { class = "OrderItem", property = "Order", cardinality = "one" },
    ]

    [[relations]]
    id = "Order:OrderTicket"
    end_points = [
        { class = "Order", property = "OrderTicket", cardinality = "one" },
        { class = "OrderTicket", property = "Order", cardinality = "one" },
    ]
"#;

/// The order relations with non-default policies: `Customer.Orders` ignores
/// duplicates and loads itself before foreign-key changes, `Order.OrderItems`
/// sorts by descending position.
pub const POLICY_RELATIONS: &str = r#"
    [[relations]]
    id = "Customer:Orders"
    duplicate_policy = "ignore"
    incomplete_sync = "load_first"
    end_points = [
        { class = "Customer", property = "Orders", cardinality = "many" },
        { class = "Order", property = "Customer", cardinality = "one" },
    ]

    [[relations]]
    id = "Order:OrderItems"
    end_points = [
        { class = "Order", property = "OrderItems", cardinality = "many", sort = { property = "Position", direction = "descending" } },
        { class = "OrderItem", property = "Order", cardinality = "one" },
    ]

    [[relations]]
    id = "Order:OrderTicket"
    end_points = [
        { class = "Order", property = "OrderTicket", cardinality = "one" },
        { class = "OrderTicket", property = "Order", cardinality = "one" },
    ]
"#;

pub fn mapping() -> Arc<MappingConfiguration> {
    Arc::new(MappingConfiguration::from_toml_str(&format!("{ORDER_CLASSES}{ORDER_RELATIONS}")).unwrap())
}

pub fn policy_mapping() -> Arc<MappingConfiguration> {
    Arc::new(MappingConfiguration::from_toml_str(&format!("{ORDER_CLASSES}{POLICY_RELATIONS}")).unwrap())
}

pub fn customer1() -> ObjectId {
    ObjectId::guid("Customer", Uuid::from_u128(1))
}

pub fn customer2() -> ObjectId {
    ObjectId::guid("Customer", Uuid::from_u128(2))
}

pub fn order1() -> ObjectId {
    ObjectId::int("Order", 1)
}

pub fn order3() -> ObjectId {
    ObjectId::int("Order", 3)
}

pub fn order_item1() -> ObjectId {
    ObjectId::int("OrderItem", 1)
}

pub fn order_item2() -> ObjectId {
    ObjectId::int("OrderItem", 2)
}

pub fn order_item3() -> ObjectId {
    ObjectId::int("OrderItem", 3)
}

pub fn order_ticket1() -> ObjectId {
    ObjectId::int("OrderTicket", 1)
}

/// Two customers; Customer1 has Order1 and Order3. Order1 has items 1 and 2
/// (positions 2 and 1) and Ticket1, Order3 has item 3 and no ticket.
pub fn seeded_store() -> InMemoryStorageProvider {
    let store = InMemoryStorageProvider::new();
    let records = [
        StorageRecord::new(customer1(), Timestamp::INITIAL).with_value("Name", "Alice"),
        StorageRecord::new(customer2(), Timestamp::INITIAL).with_value("Name", "Bob"),
        StorageRecord::new(order1(), Timestamp::INITIAL)
            .with_value("OrderNumber", 1i64)
            .with_value("Customer", customer1()),
        StorageRecord::new(order3(), Timestamp::INITIAL)
            .with_value("OrderNumber", 3i64)
            .with_value("Customer", customer1()),
        StorageRecord::new(order_item1(), Timestamp::INITIAL)
            .with_value("Position", 2i64)
            .with_value("Product", "Mainboard")
            .with_value("Order", order1()),
        StorageRecord::new(order_item2(), Timestamp::INITIAL)
            .with_value("Position", 1i64)
            .with_value("Product", "CPU")
            .with_value("Order", order1()),
        StorageRecord::new(order_item3(), Timestamp::INITIAL)
            .with_value("Position", 1i64)
            .with_value("Product", "Keyboard")
            .with_value("Order", order3()),
        StorageRecord::new(order_ticket1(), Timestamp::INITIAL)
            .with_value("FileName", "ticket1.pdf")
            .with_value("Order", order1()),
    ];
    for record in records {
        store.insert(record).unwrap();
    }
    store
}

/// Root transaction over `store` with the order mapping.
pub fn root(store: &Arc<InMemoryStorageProvider>) -> ClientTransaction<'static> {
    ClientTransaction::new_root(mapping(), store.clone())
}

/// Root transaction over `store` with [`policy_mapping`].
pub fn policy_root(store: &Arc<InMemoryStorageProvider>) -> ClientTransaction<'static> {
    ClientTransaction::new_root(policy_mapping(), store.clone())
}
