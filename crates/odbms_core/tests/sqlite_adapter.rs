use odbms_core::sql::ddl::{ColumnSpec, ColumnType, TableSpec};
use odbms_core::{
    record, Adapter, BackendKind, ConnectionConfig, Dbms, DbmsError, Filter, Record, Value,
};
use std::sync::Arc;
use tempfile::TempDir;

fn users_table() -> TableSpec {
    TableSpec::new("users")
        .column(ColumnSpec::new("name", ColumnType::Text))
        .column(ColumnSpec::new("email", ColumnType::Text).unique())
        .column(ColumnSpec::new("age", ColumnType::Integer))
        .column(ColumnSpec::new("score", ColumnType::Float))
        .column(ColumnSpec::new("tags", ColumnType::Text))
}

fn open(dir: &TempDir) -> (Dbms, Arc<dyn Adapter>) {
    let path = dir.path().join("app.db");
    let dbms = Dbms::new();
    dbms.initialize(
        BackendKind::Sqlite,
        ConnectionConfig::new(path.to_string_lossy()).with_pool_size(2),
    )
    .unwrap();
    let adapter = dbms.adapter().unwrap();
    adapter.ensure_table(&users_table()).unwrap();
    (dbms, adapter)
}

fn john() -> Record {
    record([
        ("name", Value::from("John Doe")),
        ("email", Value::from("john@example.com")),
        ("age", Value::from(30)),
    ])
}

#[test]
fn insert_find_update_remove_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let id = adapter.insert("users", &john()).unwrap();
    assert!(id.as_i64().is_some());

    let by_email = Filter::new().eq("email", "john@example.com");
    let found = adapter.find_one("users", &by_email, &[]).unwrap().unwrap();
    assert_eq!(found["age"], Value::Int(30));
    assert_eq!(found["id"], id.to_value());
    assert!(matches!(found["created_at"], Value::Timestamp(_)));

    let updated = adapter
        .update("users", &Filter::by_id(&id), &record([("age", 31)]))
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(adapter.count("users", &Filter::by_id(&id)).unwrap(), 1);
    let found = adapter.find_one("users", &by_email, &[]).unwrap().unwrap();
    assert_eq!(found["age"], Value::Int(31));

    assert_eq!(adapter.remove("users", &by_email).unwrap(), 1);
    assert!(adapter.find_one("users", &by_email, &[]).unwrap().is_none());

    dbms.shutdown().unwrap();
}

#[test]
fn sum_and_count_over_zero_rows_are_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let nobody = Filter::new().gt("age", 200);
    assert_eq!(adapter.count("users", &Filter::new()).unwrap(), 0);
    assert_eq!(adapter.sum("users", "age", &Filter::new()).unwrap(), 0.0);

    adapter.insert("users", &john()).unwrap();
    assert_eq!(adapter.count("users", &nobody).unwrap(), 0);
    assert_eq!(adapter.sum("users", "age", &nobody).unwrap(), 0.0);
    assert_eq!(adapter.sum("users", "age", &Filter::new()).unwrap(), 30.0);

    dbms.shutdown().unwrap();
}

#[test]
fn operator_filters_select_expected_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let people: Vec<Record> = [("a", 17), ("b", 30), ("c", 45), ("d", 70)]
        .into_iter()
        .map(|(name, age)| {
            record([
                ("name", Value::from(name)),
                ("email", Value::from(format!("{name}@example.com"))),
                ("age", Value::from(age)),
            ])
        })
        .collect();
    assert_eq!(adapter.insert_many("users", &people).unwrap(), 4);

    let adults = Filter::new().gte("age", 18).lt("age", 65);
    assert_eq!(adapter.count("users", &adults).unwrap(), 2);

    let picked = Filter::new().is_in("name", vec!["a", "d"]);
    let mut names: Vec<_> = adapter
        .find("users", &picked, &["name"])
        .unwrap()
        .into_iter()
        .map(|row| row["name"].to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "d"]);

    let rest = Filter::new().not_in("name", vec!["a", "d"]).ne("age", 45);
    let rows = adapter.find("users", &rest, &[]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], Value::from("b"));

    let from_mapping = Filter::from_record(&record([(
        "age",
        Value::Map(record([("$lte", 30)])),
    )]))
    .unwrap();
    assert_eq!(adapter.count("users", &from_mapping).unwrap(), 2);

    dbms.shutdown().unwrap();
}

#[test]
fn list_and_float_values_survive_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let mut row = john();
    row.insert("score".to_string(), Value::Float(9.5));
    row.insert("tags".to_string(), Value::from(vec!["admin", "ops"]));
    let id = adapter.insert("users", &row).unwrap();

    let found = adapter.find_one("users", &Filter::by_id(&id), &[]).unwrap().unwrap();
    assert_eq!(found["score"], Value::Float(9.5));
    // The list comes back as separator-joined text until a type hint is applied.
    assert_eq!(found["tags"], Value::from("admin::ops"));

    let reserved = record([("tags", Value::from(vec!["a::b"]))]);
    assert!(matches!(
        adapter.insert("users", &reserved),
        Err(DbmsError::Normalization(_))
    ));

    dbms.shutdown().unwrap();
}

#[test]
fn raw_statements_and_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);
    adapter.insert("users", &john()).unwrap();

    let result = adapter
        .execute("SELECT name FROM users WHERE age > ?", &[Value::from(18)])
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["name"], Value::from("John Doe"));

    let result = adapter
        .execute("UPDATE users SET age = ? WHERE age = ?", &[Value::from(40), Value::from(30)])
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    assert!(matches!(
        adapter.run_command("drop", &Value::from("users"), &Record::new()),
        Err(DbmsError::UnsupportedOperation { .. })
    ));

    dbms.shutdown().unwrap();
}

#[test]
fn driver_errors_carry_operation_context() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let err = adapter.insert("missing_table", &john()).unwrap_err();
    match err {
        DbmsError::Operation {
            backend,
            operation,
            table,
            ..
        } => {
            assert_eq!(backend, BackendKind::Sqlite);
            assert_eq!(operation, "insert");
            assert_eq!(table.as_deref(), Some("missing_table"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    dbms.shutdown().unwrap();
}

#[test]
fn missing_file_without_create_is_a_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.db");
    let mut config = ConnectionConfig::new(path.to_string_lossy());
    config.create_if_missing = false;

    let dbms = Dbms::new();
    let err = dbms.initialize(BackendKind::Sqlite, config).unwrap_err();
    assert!(matches!(err, DbmsError::Connection(_)));
    assert!(!dbms.is_initialized());
    assert!(!path.exists());
}

#[test]
fn negative_filters_match_rows_with_null_columns() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let rows = vec![
        record([("name", Value::from("thirty")), ("age", Value::from(30))]),
        record([("name", Value::from("forty")), ("age", Value::from(40))]),
        record([("name", Value::from("unknown")), ("age", Value::Null)]),
    ];
    assert_eq!(adapter.insert_many("users", &rows).unwrap(), 3);

    assert_eq!(adapter.count("users", &Filter::new().ne("age", 30)).unwrap(), 2);
    assert_eq!(adapter.count("users", &Filter::new().not_in("age", vec![30])).unwrap(), 2);
    assert_eq!(
        adapter
            .count("users", &Filter::new().is_in("age", vec![Value::from(30), Value::Null]))
            .unwrap(),
        2
    );
    assert_eq!(
        adapter
            .count("users", &Filter::new().not_in("age", vec![Value::from(30), Value::Null]))
            .unwrap(),
        1
    );

    dbms.shutdown().unwrap();
}

#[test]
fn update_many_and_delete_act_on_every_match() {
    let dir = tempfile::tempdir().unwrap();
    let (dbms, adapter) = open(&dir);

    let rows: Vec<Record> = [("a", 20), ("b", 20), ("c", 50)]
        .into_iter()
        .map(|(name, age)| record([("name", Value::from(name)), ("age", Value::from(age))]))
        .collect();
    adapter.insert_many("users", &rows).unwrap();

    let twenty = Filter::new().eq("age", 20);
    assert_eq!(adapter.update_many("users", &twenty, &record([("score", 1.5)])).unwrap(), 2);
    assert_eq!(adapter.sum("users", "score", &Filter::new()).unwrap(), 3.0);

    assert_eq!(adapter.delete("users", &twenty).unwrap(), 2);
    assert_eq!(adapter.count("users", &Filter::new()).unwrap(), 1);

    dbms.shutdown().unwrap();
}
