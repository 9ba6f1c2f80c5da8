//! Relational adapter shared by SQLite, MySQL and PostgreSQL.
//!
//! # Responsibility
//! - Turn adapter calls into parameterized statements for one dialect.
//! - Run them on pooled connections through a `SqlDriver`.
//! - Offer the async surface by running the blocking form on the worker.
//!
//! # Invariants
//! - Statements are fully built (and normalization errors raised) before a
//!   connection is acquired.
//! - Every checked-out connection is returned by guard drop.

use super::{borrowed_projection, owned_projection, Adapter, ExecuteResult};
use crate::config::{BackendKind, ConnectionConfig};
use crate::error::{ConnectionError, ConnectionErrorKind, DbmsError, DbmsResult, DriverError};
use crate::filter::Filter;
use crate::normalize::relational::{decode_row, encode_value, NativeRow, SqlParam};
use crate::pool::{ConnectionManager, Pool, PoolKey, PoolRegistry, PoolStatus};
use crate::sql::ddl::{self, TableSpec};
use crate::sql::{is_insert, returns_rows, statement, Dialect};
use crate::value::{Record, RecordId, Value};
use crate::worker::Worker;
use async_trait::async_trait;
use log::{debug, error, info};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Engine-specific statement execution over a pooled connection.
pub trait SqlDriver: ConnectionManager + Clone {
    fn dialect(&self) -> Dialect;

    /// Runs a statement that produces rows.
    fn fetch(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<NativeRow>, DriverError>;

    /// Runs a statement that produces no rows.
    fn run(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<RunOutcome, DriverError>;
}

struct SqlInner<D: SqlDriver> {
    driver: D,
    key: PoolKey,
    config: ConnectionConfig,
    registry: Arc<PoolRegistry>,
    worker: Arc<Worker>,
    pool: RwLock<Option<Arc<Pool<D>>>>,
}

/// Adapter for one relational engine; cheap to clone.
pub struct SqlAdapter<D: SqlDriver> {
    inner: Arc<SqlInner<D>>,
}

impl<D: SqlDriver> Clone for SqlAdapter<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn first_scalar(rows: Vec<NativeRow>) -> SqlParam {
    rows.into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .map(|(_, value)| value)
        .unwrap_or(SqlParam::Null)
}

fn scalar_to_f64(value: &SqlParam) -> f64 {
    match value {
        SqlParam::Int(number) => *number as f64,
        SqlParam::Float(number) => *number,
        SqlParam::Text(text) => text.trim().parse().unwrap_or(0.0),
        SqlParam::Bool(flag) => f64::from(u8::from(*flag)),
        SqlParam::Null => 0.0,
    }
}

fn scalar_to_u64(value: &SqlParam) -> u64 {
    match value {
        SqlParam::Int(number) => u64::try_from(*number).unwrap_or(0),
        other => scalar_to_f64(other).max(0.0) as u64,
    }
}

fn key_from_rows(rows: Vec<NativeRow>) -> Option<RecordId> {
    match first_scalar(rows) {
        SqlParam::Int(number) => Some(RecordId::from(number)),
        SqlParam::Text(text) if !text.is_empty() => Some(RecordId::from(text)),
        _ => None,
    }
}

impl<D: SqlDriver> SqlAdapter<D> {
    pub fn new(
        driver: D,
        config: ConnectionConfig,
        registry: Arc<PoolRegistry>,
        worker: Arc<Worker>,
    ) -> Self {
        let key = PoolKey::new(driver.dialect().backend(), &config);
        Self {
            inner: Arc::new(SqlInner {
                driver,
                key,
                config,
                registry,
                worker,
                pool: RwLock::new(None),
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.driver.dialect()
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// Occupancy of the connection pool, when connected.
    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.inner.pool.read().as_ref().map(|pool| pool.status())
    }

    fn pool(&self) -> DbmsResult<Arc<Pool<D>>> {
        self.inner.pool.read().clone().ok_or_else(|| {
            ConnectionError::new(
                self.kind(),
                ConnectionErrorKind::NotConnected,
                self.inner.key.to_string(),
            )
            .into()
        })
    }

    fn with_connection<T>(
        &self,
        operation: &'static str,
        table: Option<&str>,
        job: impl FnOnce(&D, &mut D::Connection) -> Result<T, DriverError>,
    ) -> DbmsResult<T> {
        let started_at = Instant::now();
        let pool = self.pool()?;
        let mut guard = pool.acquire()?;
        let conn = guard.get_mut()?;
        match job(&self.inner.driver, conn) {
            Ok(value) => {
                debug!(
                    "event=sql_op module=adapter status=ok backend={} op={} table={} duration_ms={}",
                    self.kind(),
                    operation,
                    table.unwrap_or("-"),
                    started_at.elapsed().as_millis()
                );
                Ok(value)
            }
            Err(err) => {
                error!(
                    "event=sql_op module=adapter status=error backend={} op={} table={} duration_ms={} error_code=driver_error error={}",
                    self.kind(),
                    operation,
                    table.unwrap_or("-"),
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(DbmsError::operation(self.kind(), operation, table, err))
            }
        }
    }

    fn explicit_id(record: &Record) -> Option<RecordId> {
        record.get("id").and_then(RecordId::from_value)
    }

    fn insert_on(
        &self,
        driver: &D,
        conn: &mut D::Connection,
        sql: &str,
        params: &[SqlParam],
        explicit: Option<RecordId>,
    ) -> Result<RecordId, DriverError> {
        let generated = if self.dialect().supports_returning_id() {
            key_from_rows(driver.fetch(conn, sql, params)?)
        } else {
            driver
                .run(conn, sql, params)?
                .last_insert_id
                .filter(|id| *id != 0)
                .map(RecordId::from)
        };
        explicit
            .or(generated)
            .ok_or_else(|| DriverError::from("driver reported no inserted key"))
    }
}

#[async_trait]
impl<D: SqlDriver> Adapter for SqlAdapter<D> {
    fn kind(&self) -> BackendKind {
        self.inner.driver.dialect().backend()
    }

    fn connect(&self) -> DbmsResult<()> {
        if self.inner.pool.read().is_some() {
            return Ok(());
        }
        let started_at = Instant::now();
        info!(
            "event=adapter_connect module=adapter status=start backend={} target={}",
            self.kind(),
            self.inner.config.redacted(self.kind())
        );
        let driver = self.inner.driver.clone();
        let pool = self
            .inner
            .registry
            .initialize_pool(
                self.inner.key.clone(),
                self.inner.config.pool_size,
                self.inner.config.acquire_timeout,
                move || driver,
            )
            .map_err(|err| {
                error!(
                    "event=adapter_connect module=adapter status=error backend={} duration_ms={} error_code=connect_failed error={}",
                    self.kind(),
                    started_at.elapsed().as_millis(),
                    err
                );
                err
            })?;
        *self.inner.pool.write() = Some(pool);
        info!(
            "event=adapter_connect module=adapter status=ok backend={} duration_ms={}",
            self.kind(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn disconnect(&self) -> DbmsResult<()> {
        if self.inner.pool.write().take().is_some() {
            self.inner.registry.close(&self.inner.key);
            info!(
                "event=adapter_disconnect module=adapter status=ok backend={}",
                self.kind()
            );
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.pool.read().is_some()
    }

    fn insert(&self, table: &str, record: &Record) -> DbmsResult<RecordId> {
        let statement = statement::insert(self.dialect(), table, record)?;
        let explicit = Self::explicit_id(record);
        self.with_connection("insert", Some(table), |driver, conn| {
            self.insert_on(driver, conn, &statement.sql, &statement.params, explicit)
        })
    }

    fn insert_many(&self, table: &str, records: &[Record]) -> DbmsResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let statements = records
            .iter()
            .map(|record| statement::insert(self.dialect(), table, record))
            .collect::<Result<Vec<_>, _>>()?;
        self.with_connection("insert_many", Some(table), |driver, conn| {
            let mut inserted = 0;
            for statement in &statements {
                if self.dialect().supports_returning_id() {
                    inserted += driver.fetch(conn, &statement.sql, &statement.params)?.len() as u64;
                } else {
                    inserted += driver.run(conn, &statement.sql, &statement.params)?.rows_affected;
                }
            }
            Ok(inserted)
        })
    }

    fn find(&self, table: &str, filter: &Filter, projection: &[&str]) -> DbmsResult<Vec<Record>> {
        let statement = statement::select(self.dialect(), table, filter, projection, None)?;
        let rows = self.with_connection("find", Some(table), |driver, conn| {
            driver.fetch(conn, &statement.sql, &statement.params)
        })?;
        Ok(rows.into_iter().map(decode_row).collect())
    }

    fn find_one(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> DbmsResult<Option<Record>> {
        let statement = statement::select(self.dialect(), table, filter, projection, Some(1))?;
        let rows = self.with_connection("find_one", Some(table), |driver, conn| {
            driver.fetch(conn, &statement.sql, &statement.params)
        })?;
        Ok(rows.into_iter().next().map(decode_row))
    }

    fn update(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64> {
        let Some(statement) = statement::update(self.dialect(), table, patch, filter)? else {
            return Ok(0);
        };
        self.with_connection("update", Some(table), |driver, conn| {
            Ok(driver.run(conn, &statement.sql, &statement.params)?.rows_affected)
        })
    }

    fn remove(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let statement = statement::delete(self.dialect(), table, filter)?;
        self.with_connection("remove", Some(table), |driver, conn| {
            Ok(driver.run(conn, &statement.sql, &statement.params)?.rows_affected)
        })
    }

    fn count(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let statement = statement::count(self.dialect(), table, filter)?;
        let rows = self.with_connection("count", Some(table), |driver, conn| {
            driver.fetch(conn, &statement.sql, &statement.params)
        })?;
        Ok(scalar_to_u64(&first_scalar(rows)))
    }

    fn sum(&self, table: &str, column: &str, filter: &Filter) -> DbmsResult<f64> {
        let statement = statement::sum(self.dialect(), table, column, filter)?;
        let rows = self.with_connection("sum", Some(table), |driver, conn| {
            driver.fetch(conn, &statement.sql, &statement.params)
        })?;
        Ok(scalar_to_f64(&first_scalar(rows)))
    }

    fn execute(&self, statement: &str, params: &[Value]) -> DbmsResult<ExecuteResult> {
        let params = params
            .iter()
            .map(|value| encode_value("", value))
            .collect::<Result<Vec<_>, _>>()?;
        self.with_connection("execute", None, |driver, conn| {
            if returns_rows(statement) {
                let rows: Vec<Record> = driver
                    .fetch(conn, statement, &params)?
                    .into_iter()
                    .map(decode_row)
                    .collect();
                return Ok(ExecuteResult {
                    rows_affected: rows.len() as u64,
                    last_insert_id: None,
                    rows,
                });
            }
            let outcome = driver.run(conn, statement, &params)?;
            Ok(ExecuteResult {
                rows_affected: outcome.rows_affected,
                last_insert_id: outcome
                    .last_insert_id
                    .filter(|id| *id != 0 && is_insert(statement) && outcome.rows_affected > 0)
                    .map(RecordId::from),
                rows: Vec::new(),
            })
        })
    }

    fn ensure_table(&self, spec: &TableSpec) -> DbmsResult<()> {
        let statements = ddl::create_table(self.dialect(), spec)?;
        self.with_connection("ensure_table", Some(&spec.name), |driver, conn| {
            for sql in &statements {
                driver.run(conn, sql, &[])?;
            }
            Ok(())
        })
    }

    async fn connect_async(&self) -> DbmsResult<()> {
        let this = self.clone();
        self.inner.worker.run_blocking(move || this.connect()).await
    }

    async fn disconnect_async(&self) -> DbmsResult<()> {
        let this = self.clone();
        self.inner.worker.run_blocking(move || this.disconnect()).await
    }

    async fn insert_async(&self, table: &str, record: &Record) -> DbmsResult<RecordId> {
        let (this, table, record) = (self.clone(), table.to_string(), record.clone());
        self.inner
            .worker
            .run_blocking(move || this.insert(&table, &record))
            .await
    }

    async fn insert_many_async(&self, table: &str, records: &[Record]) -> DbmsResult<u64> {
        let (this, table, records) = (self.clone(), table.to_string(), records.to_vec());
        self.inner
            .worker
            .run_blocking(move || this.insert_many(&table, &records))
            .await
    }

    async fn find_async(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> DbmsResult<Vec<Record>> {
        let (this, table, filter) = (self.clone(), table.to_string(), filter.clone());
        let projection = owned_projection(projection);
        self.inner
            .worker
            .run_blocking(move || this.find(&table, &filter, &borrowed_projection(&projection)))
            .await
    }

    async fn find_one_async(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> DbmsResult<Option<Record>> {
        let (this, table, filter) = (self.clone(), table.to_string(), filter.clone());
        let projection = owned_projection(projection);
        self.inner
            .worker
            .run_blocking(move || this.find_one(&table, &filter, &borrowed_projection(&projection)))
            .await
    }

    async fn update_async(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64> {
        let (this, table) = (self.clone(), table.to_string());
        let (filter, patch) = (filter.clone(), patch.clone());
        self.inner
            .worker
            .run_blocking(move || this.update(&table, &filter, &patch))
            .await
    }

    async fn remove_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let (this, table, filter) = (self.clone(), table.to_string(), filter.clone());
        self.inner
            .worker
            .run_blocking(move || this.remove(&table, &filter))
            .await
    }

    async fn count_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        let (this, table, filter) = (self.clone(), table.to_string(), filter.clone());
        self.inner
            .worker
            .run_blocking(move || this.count(&table, &filter))
            .await
    }

    async fn sum_async(&self, table: &str, column: &str, filter: &Filter) -> DbmsResult<f64> {
        let (this, table, column) = (self.clone(), table.to_string(), column.to_string());
        let filter = filter.clone();
        self.inner
            .worker
            .run_blocking(move || this.sum(&table, &column, &filter))
            .await
    }

    async fn execute_async(&self, statement: &str, params: &[Value]) -> DbmsResult<ExecuteResult> {
        let (this, statement, params) = (self.clone(), statement.to_string(), params.to_vec());
        self.inner
            .worker
            .run_blocking(move || this.execute(&statement, &params))
            .await
    }

    async fn ensure_table_async(&self, spec: &TableSpec) -> DbmsResult<()> {
        let (this, spec) = (self.clone(), spec.clone());
        self.inner
            .worker
            .run_blocking(move || this.ensure_table(&spec))
            .await
    }
}
