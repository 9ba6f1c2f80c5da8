//! MongoDB adapter on top of the official async driver.
//!
//! # Responsibility
//! - Map adapter calls onto collection operations with normalized documents.
//! - Serve the blocking API by blocking on the worker runtime and the async
//!   API by spawning onto it.
//!
//! # Invariants
//! - The client is bound to the worker runtime it was built on; when the
//!   worker generation changes the client is rebuilt before use.
//! - `update` upserts: a patch that matches nothing inserts one document.
//! - Raw statements are rejected with `UnsupportedOperation`.

use super::{Adapter, ExecuteResult};
use crate::config::{BackendKind, ConnectionConfig};
use crate::error::{ConnectionError, ConnectionErrorKind, DbmsError, DbmsResult};
use crate::filter::Filter;
use crate::normalize::document::{
    decode_value, encode_value, filter_to_document, from_document, patch_to_document, projection,
    to_document,
};
use crate::sql::ddl::TableSpec;
use crate::value::{Record, RecordId, Value};
use crate::worker::Worker;
use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, error, info};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Collection, Database};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

const APP_NAME: &str = "odbms";
const BACKEND: BackendKind = BackendKind::MongoDb;

struct MongoInner {
    config: ConnectionConfig,
    worker: Arc<Worker>,
    /// Client tagged with the worker generation it was built on.
    client: RwLock<Option<(u64, Client)>>,
}

/// Adapter for the document store; cheap to clone.
#[derive(Clone)]
pub struct MongoAdapter {
    inner: Arc<MongoInner>,
}

fn op_error<'a>(
    operation: &'static str,
    table: &'a str,
) -> impl FnOnce(mongodb::error::Error) -> DbmsError + 'a {
    move |err| DbmsError::operation(BACKEND, operation, Some(table), err)
}

fn inserted_key(table: &str, inserted: Bson) -> DbmsResult<RecordId> {
    match inserted {
        Bson::ObjectId(oid) => Ok(RecordId::new(oid.to_hex())),
        other => {
            let value = decode_value("id", other)?;
            RecordId::from_value(&value).ok_or_else(|| {
                DbmsError::operation(
                    BACKEND,
                    "insert",
                    Some(table),
                    format!("store returned unusable key `{value}`"),
                )
            })
        }
    }
}

fn number_to_f64(value: Option<&Bson>) -> f64 {
    match value {
        Some(Bson::Int32(number)) => f64::from(*number),
        Some(Bson::Int64(number)) => *number as f64,
        Some(Bson::Double(number)) => *number,
        Some(decimal @ Bson::Decimal128(_)) => match decode_value("total", decimal.clone()) {
            Ok(Value::Text(text)) => text.parse().unwrap_or(0.0),
            _ => 0.0,
        },
        _ => 0.0,
    }
}

/// Command replies carry cluster metadata (timestamps, binary signatures)
/// that has no canonical form; those fields fall back to extended JSON.
fn command_reply(document: Document) -> Record {
    document
        .into_iter()
        .map(|(key, value)| {
            let fallback = value.clone();
            let value = decode_value(&key, value)
                .unwrap_or_else(|_| Value::from_json(fallback.into_relaxed_extjson()));
            (key, value)
        })
        .collect()
}

fn command_document(command: &str, argument: &Value, options: &Record) -> DbmsResult<Document> {
    let mut document = Document::new();
    document.insert(command, encode_value(command, argument)?);
    for (key, value) in options {
        document.insert(key.clone(), encode_value(key, value)?);
    }
    Ok(document)
}

fn sum_pipeline(column: &str, filter: Document) -> Vec<Document> {
    vec![
        doc! { "$match": filter },
        doc! { "$group": { "_id": Bson::Null, "total": { "$sum": format!("${column}") } } },
    ]
}

async fn insert_one(collection: Collection<Document>, document: Document) -> DbmsResult<RecordId> {
    let table = collection.name().to_string();
    let result = collection
        .insert_one(document)
        .await
        .map_err(op_error("insert", &table))?;
    inserted_key(&table, result.inserted_id)
}

async fn insert_all(collection: Collection<Document>, documents: Vec<Document>) -> DbmsResult<u64> {
    if documents.is_empty() {
        return Ok(0);
    }
    let table = collection.name().to_string();
    let result = collection
        .insert_many(documents)
        .await
        .map_err(op_error("insert_many", &table))?;
    Ok(result.inserted_ids.len() as u64)
}

async fn find_all(
    collection: Collection<Document>,
    filter: Document,
    projection: Option<Document>,
) -> DbmsResult<Vec<Record>> {
    let table = collection.name().to_string();
    let mut action = collection.find(filter);
    if let Some(projection) = projection {
        action = action.projection(projection);
    }
    let cursor = action.await.map_err(op_error("find", &table))?;
    let documents: Vec<Document> = cursor
        .try_collect()
        .await
        .map_err(op_error("find", &table))?;
    documents
        .into_iter()
        .map(|document| from_document(document).map_err(DbmsError::from))
        .collect()
}

async fn find_first(
    collection: Collection<Document>,
    filter: Document,
    projection: Option<Document>,
) -> DbmsResult<Option<Record>> {
    let table = collection.name().to_string();
    let mut action = collection.find_one(filter);
    if let Some(projection) = projection {
        action = action.projection(projection);
    }
    let found = action.await.map_err(op_error("find_one", &table))?;
    Ok(found.map(from_document).transpose()?)
}

async fn update_all(collection: Collection<Document>, filter: Document, set: Document) -> DbmsResult<u64> {
    if set.is_empty() {
        return Ok(0);
    }
    let table = collection.name().to_string();
    let result = collection
        .update_many(filter, doc! { "$set": set })
        .upsert(true)
        .await
        .map_err(op_error("update", &table))?;
    Ok(result.matched_count + u64::from(result.upserted_id.is_some()))
}

async fn delete_all(collection: Collection<Document>, filter: Document) -> DbmsResult<u64> {
    let table = collection.name().to_string();
    let result = collection
        .delete_many(filter)
        .await
        .map_err(op_error("remove", &table))?;
    Ok(result.deleted_count)
}

async fn count_all(collection: Collection<Document>, filter: Document) -> DbmsResult<u64> {
    let table = collection.name().to_string();
    collection
        .count_documents(filter)
        .await
        .map_err(op_error("count", &table))
}

async fn sum_all(collection: Collection<Document>, pipeline: Vec<Document>) -> DbmsResult<f64> {
    let table = collection.name().to_string();
    let cursor = collection
        .aggregate(pipeline)
        .await
        .map_err(op_error("sum", &table))?;
    let groups: Vec<Document> = cursor
        .try_collect()
        .await
        .map_err(op_error("sum", &table))?;
    Ok(groups
        .first()
        .map(|group| number_to_f64(group.get("total")))
        .unwrap_or(0.0))
}

async fn command(database: Database, command: Document) -> DbmsResult<Record> {
    let reply = database
        .run_command(command)
        .await
        .map_err(|err| DbmsError::operation(BACKEND, "run_command", None, err))?;
    Ok(command_reply(reply))
}

async fn ping(database: Database) -> DbmsResult<()> {
    database
        .run_command(doc! { "ping": 1 })
        .await
        .map(|_| ())
        .map_err(|err| ConnectionError::new(BACKEND, ConnectionErrorKind::ConnectFailed, err.to_string()).into())
}

impl MongoAdapter {
    pub fn new(config: ConnectionConfig, worker: Arc<Worker>) -> Self {
        Self {
            inner: Arc::new(MongoInner {
                config,
                worker,
                client: RwLock::new(None),
            }),
        }
    }

    fn client_options(&self) -> ClientOptions {
        let config = &self.inner.config;
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: config.host.clone(),
            port: config.port_for(BACKEND),
        }];
        options.app_name = Some(APP_NAME.to_string());
        options.max_pool_size = u32::try_from(config.pool_size).ok();
        options.connect_timeout = Some(config.acquire_timeout);
        options.server_selection_timeout = Some(config.acquire_timeout);
        if let Some(username) = &config.username {
            let mut credential = Credential::default();
            credential.username = Some(username.clone());
            credential.password = config.password.clone();
            options.credential = Some(credential);
        }
        options
    }

    /// Builds a client inside the worker runtime so its background tasks
    /// live there.
    fn build_client(&self) -> DbmsResult<(u64, Client)> {
        let (handle, generation) = self.inner.worker.handle_and_generation()?;
        let _runtime = handle.enter();
        let client = Client::with_options(self.client_options()).map_err(|err| {
            ConnectionError::new(BACKEND, ConnectionErrorKind::ConnectFailed, err.to_string())
        })?;
        Ok((generation, client))
    }

    /// Database handle of the current client, rebuilding a client that
    /// belongs to a runtime which has since been shut down.
    fn database(&self) -> DbmsResult<Database> {
        let generation = self.inner.worker.generation()?;
        if let Some((built_on, client)) = self.inner.client.read().as_ref() {
            if *built_on == generation {
                return Ok(client.database(&self.inner.config.database));
            }
        }

        let mut slot = self.inner.client.write();
        match slot.as_ref() {
            None => Err(ConnectionError::new(
                BACKEND,
                ConnectionErrorKind::NotConnected,
                self.inner.config.redacted(BACKEND),
            )
            .into()),
            Some((built_on, client)) if *built_on == generation => {
                Ok(client.database(&self.inner.config.database))
            }
            Some(_) => {
                let (generation, client) = self.build_client()?;
                info!("event=adapter_reconnect module=mongo status=ok generation={generation}");
                let database = client.database(&self.inner.config.database);
                *slot = Some((generation, client));
                Ok(database)
            }
        }
    }

    fn collection(&self, table: &str) -> DbmsResult<Collection<Document>> {
        Ok(self.database()?.collection::<Document>(table))
    }

    fn log_outcome<T>(operation: &'static str, table: &str, started_at: Instant, result: &DbmsResult<T>) {
        match result {
            Ok(_) => debug!(
                "event=mongo_op module=adapter status=ok backend=mongodb op={} table={} duration_ms={}",
                operation,
                table,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=mongo_op module=adapter status=error backend=mongodb op={} table={} duration_ms={} error_code=driver_error error={}",
                operation,
                table,
                started_at.elapsed().as_millis(),
                err
            ),
        }
    }

    fn run<T>(
        &self,
        operation: &'static str,
        table: &str,
        future: impl Future<Output = DbmsResult<T>>,
    ) -> DbmsResult<T> {
        let started_at = Instant::now();
        let result = self.inner.worker.block_on(future).and_then(|result| result);
        Self::log_outcome(operation, table, started_at, &result);
        result
    }

    async fn run_async<T: Send + 'static>(
        &self,
        operation: &'static str,
        table: &str,
        future: impl Future<Output = DbmsResult<T>> + Send + 'static,
    ) -> DbmsResult<T> {
        let started_at = Instant::now();
        let result = self.inner.worker.spawn(future).await;
        Self::log_outcome(operation, table, started_at, &result);
        result
    }

    fn install(&self, built: (u64, Client)) {
        let previous = self.inner.client.write().replace(built);
        if let Some((_, client)) = previous {
            self.drop_client(client);
        }
    }

    fn drop_client(&self, client: Client) {
        match self.inner.worker.handle() {
            Ok(handle) => {
                let _runtime = handle.enter();
                drop(client);
            }
            Err(_) => drop(client),
        }
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    fn kind(&self) -> BackendKind {
        BACKEND
    }

    fn connect(&self) -> DbmsResult<()> {
        let started_at = Instant::now();
        info!(
            "event=adapter_connect module=adapter status=start backend=mongodb target={}",
            self.inner.config.redacted(BACKEND)
        );
        let built = self.build_client()?;
        let database = built.1.database(&self.inner.config.database);
        let result = self.inner.worker.block_on(ping(database)).and_then(|result| result);
        Self::log_outcome("connect", "-", started_at, &result);
        result?;
        self.install(built);
        Ok(())
    }

    fn disconnect(&self) -> DbmsResult<()> {
        let previous = self.inner.client.write().take();
        if let Some((_, client)) = previous {
            self.drop_client(client);
            info!("event=adapter_disconnect module=adapter status=ok backend=mongodb");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.client.read().is_some()
    }

    fn insert(&self, table: &str, record: &Record) -> DbmsResult<RecordId> {
        let document = to_document(record)?;
        let collection = self.collection(table)?;
        self.run("insert", table, insert_one(collection, document))
    }

    fn insert_many(&self, table: &str, records: &[Record]) -> DbmsResult<u64> {
        let documents = records.iter().map(to_document).collect::<Result<Vec<_>, _>>()?;
        let collection = self.collection(table)?;
        self.run("insert_many", table, insert_all(collection, documents))
    }

    fn find(&self, table: &str, filter: &Filter, fields: &[&str]) -> DbmsResult<Vec<Record>> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run("find", table, find_all(collection, query, projection(fields)))
    }

    fn find_one(&self, table: &str, filter: &Filter, fields: &[&str]) -> DbmsResult<Option<Record>> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run("find_one", table, find_first(collection, query, projection(fields)))
    }

    fn update(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64> {
        let (query, set) = (filter_to_document(filter)?, patch_to_document(patch)?);
        let collection = self.collection(table)?;
        self.run("update", table, update_all(collection, query, set))
    }

    fn remove(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run("remove", table, delete_all(collection, query))
    }

    fn count(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run("count", table, count_all(collection, query))
    }

    fn sum(&self, table: &str, column: &str, filter: &Filter) -> DbmsResult<f64> {
        let pipeline = sum_pipeline(column, filter_to_document(filter)?);
        let collection = self.collection(table)?;
        self.run("sum", table, sum_all(collection, pipeline))
    }

    fn execute(&self, _statement: &str, _params: &[Value]) -> DbmsResult<ExecuteResult> {
        Err(DbmsError::unsupported(BACKEND, "execute"))
    }

    fn run_command(&self, name: &str, argument: &Value, options: &Record) -> DbmsResult<Record> {
        let document = command_document(name, argument, options)?;
        let database = self.database()?;
        self.run("run_command", name, command(database, document))
    }

    fn ensure_table(&self, spec: &TableSpec) -> DbmsResult<()> {
        debug!(
            "event=ensure_table module=mongo status=skip table={} reason=schemaless",
            spec.name
        );
        Ok(())
    }

    async fn connect_async(&self) -> DbmsResult<()> {
        let built = self.build_client()?;
        let database = built.1.database(&self.inner.config.database);
        self.run_async("connect", "-", ping(database)).await?;
        self.install(built);
        Ok(())
    }

    async fn disconnect_async(&self) -> DbmsResult<()> {
        self.disconnect()
    }

    async fn insert_async(&self, table: &str, record: &Record) -> DbmsResult<RecordId> {
        let document = to_document(record)?;
        let collection = self.collection(table)?;
        self.run_async("insert", table, insert_one(collection, document))
            .await
    }

    async fn insert_many_async(&self, table: &str, records: &[Record]) -> DbmsResult<u64> {
        let documents = records.iter().map(to_document).collect::<Result<Vec<_>, _>>()?;
        let collection = self.collection(table)?;
        self.run_async("insert_many", table, insert_all(collection, documents))
            .await
    }

    async fn find_async(
        &self,
        table: &str,
        filter: &Filter,
        fields: &[&str],
    ) -> DbmsResult<Vec<Record>> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run_async("find", table, find_all(collection, query, projection(fields)))
            .await
    }

    async fn find_one_async(
        &self,
        table: &str,
        filter: &Filter,
        fields: &[&str],
    ) -> DbmsResult<Option<Record>> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run_async("find_one", table, find_first(collection, query, projection(fields)))
            .await
    }

    async fn update_async(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64> {
        let (query, set) = (filter_to_document(filter)?, patch_to_document(patch)?);
        let collection = self.collection(table)?;
        self.run_async("update", table, update_all(collection, query, set))
            .await
    }

    async fn remove_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run_async("remove", table, delete_all(collection, query))
            .await
    }

    async fn count_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let query = filter_to_document(filter)?;
        let collection = self.collection(table)?;
        self.run_async("count", table, count_all(collection, query))
            .await
    }

    async fn sum_async(&self, table: &str, column: &str, filter: &Filter) -> DbmsResult<f64> {
        let pipeline = sum_pipeline(column, filter_to_document(filter)?);
        let collection = self.collection(table)?;
        self.run_async("sum", table, sum_all(collection, pipeline))
            .await
    }

    async fn execute_async(&self, _statement: &str, _params: &[Value]) -> DbmsResult<ExecuteResult> {
        Err(DbmsError::unsupported(BACKEND, "execute"))
    }

    async fn run_command_async(
        &self,
        name: &str,
        argument: &Value,
        options: &Record,
    ) -> DbmsResult<Record> {
        let document = command_document(name, argument, options)?;
        let database = self.database()?;
        self.run_async("run_command", name, command(database, document))
            .await
    }

    async fn ensure_table_async(&self, spec: &TableSpec) -> DbmsResult<()> {
        self.ensure_table(spec)
    }
}
