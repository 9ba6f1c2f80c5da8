use odbms_core::{
    record, BackendKind, ConnectionConfig, Dbms, DbmsError, Field, FieldKind, Filter, Model,
    ModelSchema, Related, Relationship, SaveAction, Value,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Dbms {
    let dbms = Dbms::new();
    dbms.initialize(
        BackendKind::Sqlite,
        ConnectionConfig::new(dir.path().join("models.db").to_string_lossy()),
    )
    .unwrap();
    dbms
}

fn register_shop(dbms: &Dbms) -> (Model, Model, Model) {
    let products = dbms.register(
        ModelSchema::new("Product")
            .field(Field::string("name").max_length(40))
            .field(Field::float("price").min(0.0))
            .field(Field::list("labels", FieldKind::String).optional()),
    );
    let customers = dbms.register(
        ModelSchema::new("Customer")
            .field(Field::string("name"))
            .field(Field::email("email").unique()),
    );
    let orders = dbms.register(
        ModelSchema::new("Order")
            .field(Field::integer("quantity").min(1.0))
            .field(Field::float("unit_price"))
            .field(Field::computed(
                "total",
                FieldKind::Float { precision: None },
                |values| {
                    let quantity = values.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
                    let price = values.get("unit_price").and_then(Value::as_f64).unwrap_or(0.0);
                    Value::Float(quantity * price)
                },
            ))
            .field(Field::enumeration("status", ["pending", "shipped"]).default_value("pending"))
            .relationship(Relationship::many_to_one("customer", "Customer"))
            .relationship(Relationship::many_to_many("products", "Product").cascade()),
    );
    for model in [&products, &customers, &orders] {
        model.ensure_table().unwrap();
    }
    (products, customers, orders)
}

#[test]
fn save_inserts_then_updates_and_get_reloads_typed_values() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let (products, _, _) = register_shop(&dbms);

    let mut lamp = products.build(record([
        ("name", Value::from("Lamp")),
        ("price", Value::from("19.5")),
        ("labels", Value::from(vec!["home", "light"])),
    ]));
    assert_eq!(lamp.save().unwrap(), SaveAction::Inserted);
    let id = lamp.id().unwrap();
    let created_at = lamp.created_at().unwrap();

    let loaded = products.get(id.clone()).unwrap().unwrap();
    assert_eq!(loaded.get("price"), Some(&Value::Float(19.5)));
    assert_eq!(
        loaded.get("labels"),
        Some(&Value::List(vec![Value::from("home"), Value::from("light")]))
    );
    assert_eq!(loaded.created_at(), Some(created_at));

    let mut loaded = loaded;
    loaded.set("price", 17.0);
    assert_eq!(loaded.save().unwrap(), SaveAction::Updated);
    assert_eq!(products.count(&Filter::new()).unwrap(), 1);

    let reloaded = products.get(id).unwrap().unwrap();
    assert_eq!(reloaded.get("price"), Some(&Value::Float(17.0)));
    assert_eq!(reloaded.created_at(), Some(created_at));
    assert!(reloaded.updated_at().unwrap() >= created_at);

    assert!(products.get("999").unwrap().is_none());
    dbms.shutdown().unwrap();
}

#[test]
fn validation_fails_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let (products, customers, _) = register_shop(&dbms);

    let mut free = products.build(record([("name", Value::from("Gift")), ("price", Value::from(-1))]));
    match free.save() {
        Err(DbmsError::Validation(err)) => assert_eq!(err.field, "price"),
        other => panic!("unexpected result: {other:?}"),
    }

    let mut anonymous = customers.build(record([("email", "someone@example.com")]));
    assert!(matches!(anonymous.save(), Err(DbmsError::Validation(_))));

    assert_eq!(products.count(&Filter::new()).unwrap(), 0);
    assert_eq!(customers.count(&Filter::new()).unwrap(), 0);
    dbms.shutdown().unwrap();
}

#[test]
fn many_to_many_keeps_assignment_order_across_reload() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let (products, customers, orders) = register_shop(&dbms);

    let mut first = products.build(record([("name", Value::from("Zebra")), ("price", Value::from(2.0))]));
    let mut second = products.build(record([("name", Value::from("Apple")), ("price", Value::from(1.0))]));
    first.save().unwrap();
    second.save().unwrap();
    let mut buyer = customers.build(record([("name", "Ama"), ("email", "ama@example.com")]));
    buyer.save().unwrap();

    let mut order = orders.build(record([("quantity", Value::from(2)), ("unit_price", Value::from(1.5))]));
    order
        .set_related_many("products", &[second.clone(), first.clone()])
        .unwrap();
    order.set_related_one("customer", Some(&buyer)).unwrap();
    order.save().unwrap();
    assert_eq!(order.get("total"), Some(&Value::Float(3.0)));
    assert_eq!(order.get("status"), Some(&Value::from("pending")));

    let mut reloaded = orders.get(order.id().unwrap()).unwrap().unwrap();
    assert!(!reloaded.is_loaded("products"));
    assert_eq!(
        reloaded.related_ids("products").unwrap(),
        vec![second.id().unwrap(), first.id().unwrap()]
    );
    let names: Vec<_> = reloaded
        .related_many("products")
        .unwrap()
        .iter()
        .map(|product| product.get("name").cloned())
        .collect();
    assert_eq!(names, vec![Some(Value::from("Apple")), Some(Value::from("Zebra"))]);

    let customer = reloaded.related_one("customer").unwrap().unwrap();
    assert_eq!(customer.get("email"), Some(&Value::from("ama@example.com")));

    let json = reloaded.to_json();
    assert_eq!(json["products"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["customer"]["name"], serde_json::json!("Ama"));

    match orders.get_related(order.id().unwrap(), "products").unwrap() {
        Some(Related::Many(items)) => assert_eq!(items.len(), 2),
        other => panic!("unexpected relation: {other:?}"),
    }
    dbms.shutdown().unwrap();
}

#[test]
fn missing_related_ids_resolve_to_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let (products, customers, orders) = register_shop(&dbms);

    let mut kept = products.build(record([("name", Value::from("Kept")), ("price", Value::from(1.0))]));
    let mut gone = products.build(record([("name", Value::from("Gone")), ("price", Value::from(1.0))]));
    kept.save().unwrap();
    gone.save().unwrap();
    let mut order = orders.build(record([("quantity", Value::from(1)), ("unit_price", Value::from(1.0))]));
    order.set_related_many("products", &[gone.clone(), kept]).unwrap();
    order.save().unwrap();
    gone.delete(false).unwrap();

    let mut reloaded = orders.get(order.id().unwrap()).unwrap().unwrap();
    assert_eq!(reloaded.related_many("products").unwrap().len(), 1);
    assert!(reloaded.related_one("customer").unwrap().is_none());
    assert_eq!(customers.count(&Filter::new()).unwrap(), 0);
    dbms.shutdown().unwrap();
}

#[test]
fn cascade_delete_removes_cascadable_relationships_only() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let (products, customers, orders) = register_shop(&dbms);

    let mut product = products.build(record([("name", Value::from("Mug")), ("price", Value::from(4.0))]));
    product.save().unwrap();
    let mut buyer = customers.build(record([("name", "Kofi"), ("email", "kofi@example.com")]));
    buyer.save().unwrap();
    let mut order = orders.build(record([("quantity", Value::from(1)), ("unit_price", Value::from(4.0))]));
    order.set_related_many("products", &[product]).unwrap();
    order.set_related_one("customer", Some(&buyer)).unwrap();
    order.save().unwrap();

    let mut plain = orders.get(order.id().unwrap()).unwrap().unwrap();
    assert_eq!(plain.delete(true).unwrap(), 1);
    assert_eq!(orders.count(&Filter::new()).unwrap(), 0);
    assert_eq!(products.count(&Filter::new()).unwrap(), 0);
    assert_eq!(customers.count(&Filter::new()).unwrap(), 1);
    dbms.shutdown().unwrap();
}

#[test]
fn hooks_run_in_lifecycle_order_and_can_reject() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let (before, after, before_delete, after_delete) = (
        Arc::clone(&calls),
        Arc::clone(&calls),
        Arc::clone(&calls),
        Arc::clone(&calls),
    );
    let notes = dbms.register(
        ModelSchema::new("Note")
            .field(Field::string("body"))
            .field(Field::string("slug").optional())
            .before_save(move |note| {
                before.lock().unwrap().push("before_save");
                let slug = note.get("body").map(|body| body.to_string().to_lowercase());
                note.set("slug", slug);
                Ok(())
            })
            .after_save(move |note| {
                assert!(note.id().is_some());
                after.lock().unwrap().push("after_save");
                Ok(())
            })
            .before_delete(move |note| {
                before_delete.lock().unwrap().push("before_delete");
                match note.get("body") {
                    Some(Value::Text(body)) if body == "Pinned" => {
                        Err(DbmsError::Hook("pinned notes cannot be deleted".to_string()))
                    }
                    _ => Ok(()),
                }
            })
            .after_delete(move |_| {
                after_delete.lock().unwrap().push("after_delete");
                Ok(())
            }),
    );
    notes.ensure_table().unwrap();

    let mut note = notes.build(record([("body", "Hello")]));
    note.save().unwrap();
    assert_eq!(note.get("slug"), Some(&Value::from("hello")));
    note.delete(false).unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["before_save", "after_save", "before_delete", "after_delete"]
    );

    let mut pinned = notes.build(record([("body", "Pinned")]));
    pinned.save().unwrap();
    assert!(matches!(pinned.delete(false), Err(DbmsError::Hook(_))));
    assert_eq!(notes.count(&Filter::new()).unwrap(), 1);
    dbms.shutdown().unwrap();
}

#[test]
fn model_operations_fail_fast_before_initialize() {
    let dbms = Dbms::new();
    let products = dbms.register(ModelSchema::new("Product").field(Field::string("name")));
    let mut lamp = products.build(record([("name", "Lamp")]));

    assert!(matches!(lamp.save(), Err(DbmsError::NotInitialized)));
    assert!(matches!(products.find(&Filter::new()), Err(DbmsError::NotInitialized)));
    assert!(matches!(products.get("1"), Err(DbmsError::NotInitialized)));
    assert!(lamp.id().is_none());
}

#[test]
fn text_fields_named_like_references_keep_their_exact_text() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir);
    let parcels = dbms.register(ModelSchema::new("Parcel").field(Field::string("tracking_id")));
    parcels.ensure_table().unwrap();

    for tracking in ["007", "12", "AB-12"] {
        let mut parcel = parcels.build(record([("tracking_id", tracking)]));
        parcel.save().unwrap();
        let loaded = parcels.get(parcel.id().unwrap()).unwrap().unwrap();
        assert_eq!(loaded.get("tracking_id"), Some(&Value::from(tracking)));

        let by_tracking = Filter::new().eq("tracking_id", tracking);
        assert_eq!(parcels.count(&by_tracking).unwrap(), 1);
    }
    dbms.shutdown().unwrap();
}
