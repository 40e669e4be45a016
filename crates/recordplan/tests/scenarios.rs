//! Black-box scenario tests driven entirely through the public [`Dbo`]
//! facade — unlike the planners' own unit tests, these exercise the full
//! build → execute → result pipeline against [`InMemoryDriver`].

use std::sync::Arc;

use chrono::Utc;
use recordplan::driver::{DbDriver, InMemoryDriver};
use recordplan::schema::{
    ChildTableLayout, Generator, MetaInfoMapping, PropertyDescriptor, PropertyFlags,
    RecordContainer, RecordTypeDescriptor, RecordTypeLibrary, StaticLibrary, StorageShape,
    StructuralKind, ValueType,
};
use recordplan::Dbo;

fn scalar_prop(
    name: &str,
    value_type: ValueType,
    flags: PropertyFlags,
    generator: Generator,
) -> PropertyDescriptor {
    PropertyDescriptor {
        name: name.to_string(),
        structural_kind: StructuralKind::Scalar,
        value_type,
        storage_shape: StorageShape::InlineColumn,
        generator,
        flags,
        child_table: None,
        column: Some(name.to_string()),
        nested: None,
        subtypes: Vec::new(),
    }
}

/// S1 — `Account{ id:string(assigned), email:string, balance:number }`.
fn account_library() -> StaticLibrary {
    let mut lib = StaticLibrary::new();
    lib.register(RecordTypeDescriptor {
        name: "Account".to_string(),
        main_table: "accounts".to_string(),
        id_property: "id".to_string(),
        container: Arc::new(RecordContainer {
            properties: vec![
                scalar_prop("id", ValueType::String, PropertyFlags::ID, Generator::None),
                scalar_prop("email", ValueType::String, PropertyFlags::empty(), Generator::None),
                scalar_prop("balance", ValueType::Number, PropertyFlags::empty(), Generator::None),
            ],
        }),
        meta_info: None,
        subtypes: Vec::new(),
        discriminator_property: None,
        super_container: None,
    });
    lib
}

#[tokio::test]
async fn s1_assigned_id_insert_via_dbo_facade() {
    let lib: Arc<dyn RecordTypeLibrary> = Arc::new(account_library());
    let dbo = Dbo::new(lib, None);
    let insert = dbo
        .build_insert("Account", &serde_json::json!({"id": "acc-1", "email": "a@x", "balance": 100}))
        .unwrap();

    let driver = Arc::new(InMemoryDriver::new());
    let result = insert
        .execute(driver.clone(), None, Utc::now())
        .await
        .unwrap();

    assert_eq!(result.id, serde_json::json!("acc-1"));
    assert!(driver
        .statements()
        .iter()
        .any(|s| s == "INSERT INTO accounts (id, email, balance) VALUES ('acc-1', 'a@x', 100)"));
}

/// S2 — `Order{ id:num(auto), lines:[{sku,qty}] }` with a child table.
fn order_library() -> StaticLibrary {
    let mut lib = StaticLibrary::new();
    let line_container = Arc::new(RecordContainer {
        properties: vec![
            scalar_prop("sku", ValueType::String, PropertyFlags::empty(), Generator::None),
            scalar_prop("qty", ValueType::Number, PropertyFlags::empty(), Generator::None),
        ],
    });
    let lines_prop = PropertyDescriptor {
        name: "lines".to_string(),
        structural_kind: StructuralKind::Array,
        value_type: ValueType::Object,
        storage_shape: StorageShape::ChildTable,
        generator: Generator::None,
        flags: PropertyFlags::empty(),
        child_table: Some(ChildTableLayout {
            table: "order_lines".to_string(),
            parent_id_column: "order_id".to_string(),
            index_column: Some("idx".to_string()),
            key_column: None,
            key_value_type: None,
        }),
        column: None,
        nested: Some(line_container),
        subtypes: Vec::new(),
    };
    let status_prop = scalar_prop("status", ValueType::String, PropertyFlags::empty(), Generator::None);
    lib.register(RecordTypeDescriptor {
        name: "Order".to_string(),
        main_table: "orders".to_string(),
        id_property: "id".to_string(),
        container: Arc::new(RecordContainer {
            properties: vec![
                scalar_prop("id", ValueType::Number, PropertyFlags::ID, Generator::Auto),
                status_prop,
                lines_prop,
            ],
        }),
        meta_info: Some(MetaInfoMapping::default()),
        subtypes: Vec::new(),
        discriminator_property: None,
        super_container: None,
    });
    lib
}

#[tokio::test]
async fn s2_auto_id_insert_with_child_array_via_dbo_facade() {
    let lib: Arc<dyn RecordTypeLibrary> = Arc::new(order_library());
    let dbo = Dbo::new(lib, None);
    let insert = dbo
        .build_insert(
            "Order",
            &serde_json::json!({"status": "new", "lines": [{"sku": "A", "qty": 2}, {"sku": "B", "qty": 1}]}),
        )
        .unwrap();

    let driver = Arc::new(InMemoryDriver::new());
    let result = insert
        .execute(driver.clone(), None, Utc::now())
        .await
        .unwrap();

    assert_eq!(result.id, serde_json::json!(1));
    let statements = driver.statements();
    assert!(statements.iter().any(|s| s.contains("RETURNING id")));
    assert!(statements
        .iter()
        .any(|s| s == "INSERT INTO order_lines (order_id, idx, sku, qty) VALUES (1, 0, 'A', 2)"));
    assert!(statements
        .iter()
        .any(|s| s == "INSERT INTO order_lines (order_id, idx, sku, qty) VALUES (1, 1, 'B', 1)"));
}

/// S3 — filtered delete of the same `Order` type cascades to `order_lines`
/// via the anchored strategy.
#[tokio::test]
async fn s3_filtered_delete_via_dbo_facade() {
    let lib: Arc<dyn RecordTypeLibrary> = Arc::new(order_library());
    let dbo = Dbo::new(lib, None);
    let filter = serde_json::json!(["status|eq", "cancelled"]);
    let delete = dbo.build_delete("Order", Some(&filter)).unwrap();

    let driver = Arc::new(InMemoryDriver::new());
    let result = delete
        .execute(driver.clone(), None, Utc::now())
        .await
        .unwrap();

    assert_eq!(result.records_deleted.get("Order"), Some(&1));
    let statements = driver.statements();
    assert!(statements.iter().any(|s| s.contains("INTO q_orders")));
    assert!(statements
        .iter()
        .any(|s| s == "DELETE FROM order_lines WHERE order_id IN (SELECT id FROM q_orders)"));
    assert!(statements
        .iter()
        .any(|s| s == "DELETE FROM orders WHERE id IN (SELECT id FROM q_orders)"));
    assert!(statements.iter().any(|s| s.starts_with("DROP TABLE q_orders")));
}

/// S4 — patch update with a `version` guard, once passing and once failing.
fn product_library() -> StaticLibrary {
    let mut lib = StaticLibrary::new();
    lib.register(RecordTypeDescriptor {
        name: "Product".to_string(),
        main_table: "products".to_string(),
        id_property: "id".to_string(),
        container: Arc::new(RecordContainer {
            properties: vec![
                scalar_prop("id", ValueType::Number, PropertyFlags::ID, Generator::Auto),
                scalar_prop("name", ValueType::String, PropertyFlags::empty(), Generator::None),
                scalar_prop("price", ValueType::Number, PropertyFlags::empty(), Generator::None),
                scalar_prop(
                    "version",
                    ValueType::Number,
                    PropertyFlags::RECORD_META_INFO,
                    Generator::None,
                ),
            ],
        }),
        meta_info: Some(MetaInfoMapping {
            version: Some("version".to_string()),
            modification_timestamp: Some("modificationTimestamp".to_string()),
            modification_actor: Some("modificationActor".to_string()),
            ..Default::default()
        }),
        subtypes: Vec::new(),
        discriminator_property: None,
        super_container: None,
    });
    lib
}

#[tokio::test]
async fn s4_patch_update_with_passing_version_test_via_dbo_facade() {
    let lib: Arc<dyn RecordTypeLibrary> = Arc::new(product_library());
    let dbo = Dbo::new(lib, None);
    let patch = serde_json::json!([
        {"op": "test", "path": "/version", "value": 3},
        {"op": "replace", "path": "/price", "value": 9.99}
    ]);
    let filter = serde_json::json!(["id|eq", 7]);
    let update = dbo.build_update("Product", &patch, Some(&filter)).unwrap();

    let driver = Arc::new(InMemoryDriver::new());
    let mut row = std::collections::HashMap::new();
    row.insert("id".to_string(), serde_json::json!(7));
    row.insert("version".to_string(), serde_json::json!(3));
    driver.seed_query_result(
        "SELECT t0.id, t0.version, t0.price FROM products t0 WHERE t0.id = 7",
        vec![row],
    );

    let result = update
        .execute(driver.clone(), Some("user-1".to_string()), Utc::now())
        .await
        .unwrap();

    assert_eq!(result.records_updated, 1);
    assert!(!result.test_failed);
    assert!(result.failed_record_ids.is_empty());
}

#[tokio::test]
async fn s4_patch_update_with_failing_version_test_via_dbo_facade() {
    let lib: Arc<dyn RecordTypeLibrary> = Arc::new(product_library());
    let dbo = Dbo::new(lib, None);
    let patch = serde_json::json!([
        {"op": "test", "path": "/version", "value": 3},
        {"op": "replace", "path": "/price", "value": 9.99}
    ]);
    let filter = serde_json::json!(["id|eq", 7]);
    let update = dbo.build_update("Product", &patch, Some(&filter)).unwrap();

    let driver = Arc::new(InMemoryDriver::new());
    let mut row = std::collections::HashMap::new();
    row.insert("id".to_string(), serde_json::json!(7));
    row.insert("version".to_string(), serde_json::json!(4));
    driver.seed_query_result(
        "SELECT t0.id, t0.version, t0.price FROM products t0 WHERE t0.id = 7",
        vec![row],
    );

    let result = update
        .execute(driver.clone(), Some("user-1".to_string()), Utc::now())
        .await
        .unwrap();

    assert_eq!(result.records_updated, 0);
    assert!(result.test_failed);
    assert_eq!(result.failed_record_ids, vec![serde_json::json!(7)]);
}

/// S6 — entangled fan-out: inserting a `Post` linked to authors 3 and 5
/// bumps both authors' meta-info in one follow-up `UPDATE`.
fn post_and_author_library() -> StaticLibrary {
    let mut lib = StaticLibrary::new();
    lib.register(RecordTypeDescriptor {
        name: "Author".to_string(),
        main_table: "authors".to_string(),
        id_property: "id".to_string(),
        container: Arc::new(RecordContainer {
            properties: vec![
                scalar_prop("id", ValueType::Number, PropertyFlags::ID, Generator::Auto),
                scalar_prop("name", ValueType::String, PropertyFlags::empty(), Generator::None),
            ],
        }),
        meta_info: Some(MetaInfoMapping {
            version: Some("version".to_string()),
            modification_timestamp: Some("modificationTimestamp".to_string()),
            modification_actor: Some("modificationActor".to_string()),
            ..Default::default()
        }),
        subtypes: Vec::new(),
        discriminator_property: None,
        super_container: None,
    });

    let authors_link = PropertyDescriptor {
        name: "authorIds".to_string(),
        structural_kind: StructuralKind::Array,
        value_type: ValueType::Ref("Author".to_string()),
        storage_shape: StorageShape::LinkTable,
        generator: Generator::None,
        flags: PropertyFlags::ENTANGLED,
        child_table: Some(ChildTableLayout {
            table: "post_authors".to_string(),
            parent_id_column: "post_id".to_string(),
            index_column: None,
            key_column: Some("author_id".to_string()),
            key_value_type: None,
        }),
        column: None,
        nested: None,
        subtypes: Vec::new(),
    };

    lib.register(RecordTypeDescriptor {
        name: "Post".to_string(),
        main_table: "posts".to_string(),
        id_property: "id".to_string(),
        container: Arc::new(RecordContainer {
            properties: vec![
                scalar_prop("id", ValueType::Number, PropertyFlags::ID, Generator::Auto),
                scalar_prop("title", ValueType::String, PropertyFlags::empty(), Generator::None),
                authors_link,
            ],
        }),
        meta_info: Some(MetaInfoMapping::default()),
        subtypes: Vec::new(),
        discriminator_property: None,
        super_container: None,
    });
    lib
}

#[tokio::test]
async fn s6_entangled_fan_out_on_insert_via_dbo_facade() {
    let lib: Arc<dyn RecordTypeLibrary> = Arc::new(post_and_author_library());
    let dbo = Dbo::new(lib, None);
    let insert = dbo
        .build_insert(
            "Post",
            &serde_json::json!({"title": "Hello", "authorIds": [3, 5]}),
        )
        .unwrap();

    let driver = Arc::new(InMemoryDriver::new());
    insert
        .execute(driver.clone(), Some("user-1".to_string()), Utc::now())
        .await
        .unwrap();

    let statements = driver.statements();
    assert!(statements.iter().any(|s| {
        s.starts_with("UPDATE authors SET version = version + 1, modificationTimestamp = '")
            && (s.ends_with("WHERE id IN (3, 5)") || s.ends_with("WHERE id IN (5, 3)"))
    }));
}
