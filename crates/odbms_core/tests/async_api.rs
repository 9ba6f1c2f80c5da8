use futures::future::FutureExt;
use odbms_core::{
    record, BackendKind, ConnectionConfig, Dbms, DbmsError, Field, Filter, ModelSchema,
    Relationship, SaveAction, Value,
};
use std::sync::{Arc, Mutex};

async fn open(dir: &tempfile::TempDir) -> Dbms {
    let dbms = Dbms::new();
    dbms.initialize_async(
        BackendKind::Sqlite,
        ConnectionConfig::new(dir.path().join("async.db").to_string_lossy()),
    )
    .await
    .unwrap();
    dbms
}

#[tokio::test]
async fn async_adapter_surface_matches_blocking_one() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir).await;
    let users = dbms.register(
        ModelSchema::new("User")
            .field(Field::string("name"))
            .field(Field::integer("age")),
    );
    users.ensure_table_async().await.unwrap();
    let adapter = dbms.adapter().unwrap();

    let id = adapter
        .insert_async("users", &record([("name", Value::from("Efua")), ("age", Value::from(28))]))
        .await
        .unwrap();
    let found = adapter
        .find_one_async("users", &Filter::by_id(&id), &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["age"], Value::Int(28));

    let older = Filter::new().gte("age", 30);
    assert_eq!(adapter.count_async("users", &older).await.unwrap(), 0);
    assert_eq!(adapter.sum_async("users", "age", &older).await.unwrap(), 0.0);

    adapter
        .update_async("users", &Filter::by_id(&id), &record([("age", 33)]))
        .await
        .unwrap();
    assert_eq!(adapter.count_async("users", &older).await.unwrap(), 1);
    assert_eq!(adapter.remove_async("users", &older).await.unwrap(), 1);
    assert!(adapter.find_async("users", &Filter::new(), &[]).await.unwrap().is_empty());

    dbms.shutdown_async().await.unwrap();
    assert!(matches!(dbms.adapter(), Err(DbmsError::NotInitialized)));
}

#[tokio::test]
async fn async_lifecycle_runs_async_and_blocking_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir).await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (blocking, nonblocking) = (Arc::clone(&calls), Arc::clone(&calls));

    let tags = dbms.register(ModelSchema::new("Tag").field(Field::string("label")));
    let posts = dbms.register(
        ModelSchema::new("Post")
            .field(Field::string("title"))
            .relationship(Relationship::many_to_many("tags", "Tag").eager())
            .before_save(move |_| {
                blocking.lock().unwrap().push("blocking");
                Ok(())
            })
            .before_save_async(move |post| {
                let calls = Arc::clone(&nonblocking);
                async move {
                    calls.lock().unwrap().push("async");
                    post.set("title", "From hook");
                    Ok(())
                }
                .boxed()
            }),
    );
    tags.ensure_table_async().await.unwrap();
    posts.ensure_table_async().await.unwrap();

    let mut rust = tags.build(record([("label", "rust")]));
    let mut db = tags.build(record([("label", "db")]));
    assert_eq!(rust.save_async().await.unwrap(), SaveAction::Inserted);
    db.save_async().await.unwrap();

    let mut post = posts.build(record([("title", "Draft")]));
    post.set_related_many("tags", &[db.clone(), rust.clone()]).unwrap();
    post.save_async().await.unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["async", "blocking"]);
    assert_eq!(post.get("title"), Some(&Value::from("From hook")));

    let loaded = posts.get_async(post.id().unwrap()).await.unwrap().unwrap();
    assert!(loaded.is_loaded("tags"));
    let mut loaded = loaded;
    let labels: Vec<_> = loaded
        .related_many_async("tags")
        .await
        .unwrap()
        .iter()
        .map(|tag| tag.get("label").cloned())
        .collect();
    assert_eq!(labels, vec![Some(Value::from("db")), Some(Value::from("rust"))]);

    assert_eq!(posts.count_async(&Filter::new()).await.unwrap(), 1);
    assert_eq!(loaded.delete_async(false).await.unwrap(), 1);
    assert!(posts.all_async().await.unwrap().is_empty());
    assert_eq!(tags.find_async(&Filter::new()).await.unwrap().len(), 2);

    dbms.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn async_operations_fail_fast_before_initialize() {
    let dbms = Dbms::new();
    let users = dbms.register(ModelSchema::new("User").field(Field::string("name")));
    let mut user = users.build(record([("name", "Yaw")]));
    assert!(matches!(user.save_async().await, Err(DbmsError::NotInitialized)));
    assert!(matches!(users.get_async("1").await, Err(DbmsError::NotInitialized)));
}

#[tokio::test]
async fn async_aliases_delegate_to_update_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let dbms = open(&dir).await;
    let users = dbms.register(ModelSchema::new("User").field(Field::string("name")));
    users.ensure_table_async().await.unwrap();
    let adapter = dbms.adapter().unwrap();

    adapter.insert_async("users", &record([("name", "Kwame")])).await.unwrap();
    adapter.insert_async("users", &record([("name", "Kwame")])).await.unwrap();

    let kwame = Filter::new().eq("name", "Kwame");
    assert_eq!(
        adapter
            .update_many_async("users", &kwame, &record([("name", "Kojo")]))
            .await
            .unwrap(),
        2
    );
    let kojo = Filter::new().eq("name", "Kojo");
    assert_eq!(adapter.delete_async("users", &kojo).await.unwrap(), 2);
    assert_eq!(adapter.count_async("users", &Filter::new()).await.unwrap(), 0);

    dbms.shutdown_async().await.unwrap();
}
