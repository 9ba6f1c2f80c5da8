//! Dispatcher handle that owns the single active adapter.
//!
//! # Responsibility
//! - Build and connect exactly one adapter for the configured backend.
//! - Be the only path from the model layer to storage.
//! - Keep the model registry used to resolve relationships by name.
//!
//! # Invariants
//! - Before `initialize` (or after `shutdown`) every adapter lookup fails
//!   with `DbmsError::NotInitialized`.
//! - A handle is initialized at most once until it is shut down.
//! - Clones share the same adapter, registry, pools and worker.
//!
//! # See also
//! - `crate::model` for the entity layer built on top of this handle.

use crate::adapter::{Adapter, MongoAdapter, MySqlDriver, PostgresDriver, SqlAdapter, SqliteDriver};
use crate::config::{BackendKind, ConnectionConfig, DEFAULT_WORKER_THREADS};
use crate::error::{DbmsError, DbmsResult, ValidationError};
use crate::model::{Model, ModelSchema};
use crate::pool::PoolRegistry;
use crate::worker::Worker;
use log::{error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

struct DbmsInner {
    adapter: RwLock<Option<Arc<dyn Adapter>>>,
    models: RwLock<HashMap<String, Arc<ModelSchema>>>,
    registry: Arc<PoolRegistry>,
    worker: RwLock<Arc<Worker>>,
}

/// Explicit replacement for a process-wide database singleton.
#[derive(Clone)]
pub struct Dbms {
    inner: Arc<DbmsInner>,
}

impl Default for Dbms {
    fn default() -> Self {
        Self::new()
    }
}

impl Dbms {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DbmsInner {
                adapter: RwLock::new(None),
                models: RwLock::new(HashMap::new()),
                registry: Arc::new(PoolRegistry::new()),
                worker: RwLock::new(Arc::new(Worker::new(DEFAULT_WORKER_THREADS))),
            }),
        }
    }

    /// Connects the adapter for `kind` and makes it the active backend.
    ///
    /// Blocking; call [`Dbms::initialize_async`] from async code.
    pub fn initialize(&self, kind: BackendKind, config: ConnectionConfig) -> DbmsResult<()> {
        let started_at = Instant::now();
        let mut slot = self.inner.adapter.write();
        if let Some(active) = slot.as_ref() {
            return Err(DbmsError::AlreadyInitialized(active.kind()));
        }
        let adapter = self.build_adapter(kind, config)?;
        adapter.connect().map_err(|err| {
            error!(
                "event=dbms_init module=dbms status=error backend={} duration_ms={} error_code=connect_failed error={}",
                kind,
                started_at.elapsed().as_millis(),
                err
            );
            err
        })?;
        *slot = Some(adapter);
        info!(
            "event=dbms_init module=dbms status=ok backend={} duration_ms={}",
            kind,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    pub async fn initialize_async(&self, kind: BackendKind, config: ConnectionConfig) -> DbmsResult<()> {
        let started_at = Instant::now();
        if let Some(active) = self.inner.adapter.read().as_ref() {
            return Err(DbmsError::AlreadyInitialized(active.kind()));
        }
        let adapter = self.build_adapter(kind, config)?;
        adapter.connect_async().await?;

        let rejected = {
            let mut slot = self.inner.adapter.write();
            match slot.as_ref() {
                Some(active) => Some(active.kind()),
                None => {
                    *slot = Some(Arc::clone(&adapter));
                    None
                }
            }
        };
        if let Some(active) = rejected {
            warn!("event=dbms_init module=dbms status=error backend={kind} error_code=race_lost");
            adapter.disconnect_async().await?;
            return Err(DbmsError::AlreadyInitialized(active));
        }
        info!(
            "event=dbms_init module=dbms status=ok backend={} duration_ms={}",
            kind,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Installs an already connected adapter, e.g. a test double.
    pub fn with_adapter(&self, adapter: Arc<dyn Adapter>) -> DbmsResult<()> {
        let mut slot = self.inner.adapter.write();
        if let Some(active) = slot.as_ref() {
            return Err(DbmsError::AlreadyInitialized(active.kind()));
        }
        info!(
            "event=dbms_init module=dbms status=ok backend={} source=injected",
            adapter.kind()
        );
        *slot = Some(adapter);
        Ok(())
    }

    fn build_adapter(&self, kind: BackendKind, config: ConnectionConfig) -> DbmsResult<Arc<dyn Adapter>> {
        config
            .validate()
            .map_err(|message| ValidationError::new("config", message))?;
        let worker = self.replace_worker(config.worker_threads);
        let registry = Arc::clone(&self.inner.registry);
        info!(
            "event=dbms_init module=dbms status=start backend={} target={}",
            kind,
            config.redacted(kind)
        );
        Ok(match kind {
            BackendKind::Sqlite => Arc::new(SqlAdapter::new(
                SqliteDriver::new(&config),
                config,
                registry,
                worker,
            )),
            BackendKind::MySql => Arc::new(SqlAdapter::new(
                MySqlDriver::new(config.clone(), Arc::clone(&worker)),
                config,
                registry,
                worker,
            )),
            BackendKind::PostgreSql => Arc::new(SqlAdapter::new(
                PostgresDriver::new(config.clone(), Arc::clone(&worker)),
                config,
                registry,
                worker,
            )),
            BackendKind::MongoDb => Arc::new(MongoAdapter::new(config, worker)),
        })
    }

    /// Resizes the worker when the configured thread count differs.
    fn replace_worker(&self, threads: usize) -> Arc<Worker> {
        let mut worker = self.inner.worker.write();
        if worker.threads() != threads.max(1) {
            *worker = Arc::new(Worker::new(threads));
        }
        Arc::clone(&worker)
    }

    /// The active adapter; `NotInitialized` before initialization.
    pub fn adapter(&self) -> DbmsResult<Arc<dyn Adapter>> {
        self.inner
            .adapter
            .read()
            .clone()
            .ok_or(DbmsError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.adapter.read().is_some()
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.inner.adapter.read().as_ref().map(|adapter| adapter.kind())
    }

    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.inner.worker.read())
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.inner.registry
    }

    /// Registers an entity type by name and returns its handle.
    ///
    /// Registering a name again replaces the earlier schema.
    pub fn register(&self, schema: ModelSchema) -> Model {
        let schema = Arc::new(schema);
        let replaced = self
            .inner
            .models
            .write()
            .insert(schema.name().to_string(), Arc::clone(&schema));
        if replaced.is_some() {
            warn!(
                "event=model_register module=dbms status=ok model={} replaced=true",
                schema.name()
            );
        }
        Model::new(self.clone(), schema)
    }

    /// Handle of a registered entity type.
    pub fn model(&self, name: &str) -> DbmsResult<Model> {
        self.schema(name)
            .map(|schema| Model::new(self.clone(), schema))
            .ok_or_else(|| DbmsError::Model(format!("model `{name}` is not registered")))
    }

    pub(crate) fn schema(&self, name: &str) -> Option<Arc<ModelSchema>> {
        self.inner.models.read().get(name).cloned()
    }

    /// Disconnects the adapter, closes every pool and stops the worker.
    ///
    /// The handle can be initialized again afterwards.
    pub fn shutdown(&self) -> DbmsResult<()> {
        let adapter = self.inner.adapter.write().take();
        let result = match adapter {
            Some(adapter) => adapter.disconnect(),
            None => Ok(()),
        };
        self.inner.registry.close_all();
        self.worker().shutdown();
        info!("event=dbms_shutdown module=dbms status=ok");
        result
    }

    pub async fn shutdown_async(&self) -> DbmsResult<()> {
        let adapter = self.inner.adapter.write().take();
        let result = match adapter {
            Some(adapter) => adapter.disconnect_async().await,
            None => Ok(()),
        };
        let worker = self.worker();
        let registry = Arc::clone(&self.inner.registry);
        worker
            .run_blocking(move || {
                registry.close_all();
                Ok(())
            })
            .await?;
        worker.shutdown();
        info!("event=dbms_shutdown module=dbms status=ok");
        result
    }
}

impl std::fmt::Debug for Dbms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dbms")
            .field("backend", &self.backend())
            .field("models", &self.inner.models.read().len())
            .field("pools", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_lookup_fails_fast_before_initialize() {
        let dbms = Dbms::new();
        assert!(matches!(dbms.adapter(), Err(DbmsError::NotInitialized)));
        assert_eq!(dbms.backend(), None);
    }

    #[test]
    fn second_initialize_is_rejected() {
        let dbms = Dbms::new();
        dbms.initialize(BackendKind::Sqlite, ConnectionConfig::new(":memory:"))
            .unwrap();
        let err = dbms
            .initialize(BackendKind::Sqlite, ConnectionConfig::new(":memory:"))
            .unwrap_err();
        assert!(matches!(err, DbmsError::AlreadyInitialized(BackendKind::Sqlite)));
        dbms.shutdown().unwrap();
        assert!(!dbms.is_initialized());
    }

    #[test]
    fn invalid_config_is_a_validation_error() {
        let dbms = Dbms::new();
        let err = dbms
            .initialize(BackendKind::Sqlite, ConnectionConfig::new(""))
            .unwrap_err();
        assert!(matches!(err, DbmsError::Validation(_)));
        assert!(!dbms.is_initialized());
    }

    #[test]
    fn unknown_model_is_reported() {
        let dbms = Dbms::new();
        assert!(matches!(dbms.model("Ghost"), Err(DbmsError::Model(_))));
    }
}
