//! Uniform storage contract and its backend implementations.
//!
//! # Responsibility
//! - Define the one operation surface the model layer and external callers
//!   (such as a migration runner) use, in blocking and async form.
//! - Host one implementation per backend: `SqlAdapter` over a `SqlDriver`
//!   for the relational engines, `MongoAdapter` for the document store.
//!
//! # Invariants
//! - Every operation takes canonical records/filters and normalizes them
//!   before touching a driver.
//! - Driver failures surface as `DbmsError::Operation` with backend,
//!   operation and table context; nothing is retried.
//!
//! # See also
//! - `crate::normalize` for the value translation rules.

pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod sql;
pub mod sqlite;

use crate::config::BackendKind;
use crate::error::{DbmsError, DbmsResult};
use crate::filter::Filter;
use crate::sql::ddl::TableSpec;
use crate::value::{Record, RecordId, Value};
use async_trait::async_trait;

pub use mongo::MongoAdapter;
pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;
pub use sql::{RunOutcome, SqlAdapter, SqlDriver};
pub use sqlite::SqliteDriver;

/// Storage family; decides how records are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Document,
    Relational,
}

impl From<BackendKind> for Family {
    fn from(kind: BackendKind) -> Self {
        if kind.is_relational() {
            Self::Relational
        } else {
            Self::Document
        }
    }
}

/// Outcome of a raw statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    /// Key of the inserted row, for single-row inserts.
    pub last_insert_id: Option<RecordId>,
    pub rows: Vec<Record>,
}

/// Operations every backend supports.
///
/// The blocking methods must not be called from inside an async task; use
/// the `_async` forms there.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn family(&self) -> Family {
        Family::from(self.kind())
    }

    fn connect(&self) -> DbmsResult<()>;
    fn disconnect(&self) -> DbmsResult<()>;
    fn is_connected(&self) -> bool;

    /// Inserts one record and returns its identifier.
    fn insert(&self, table: &str, record: &Record) -> DbmsResult<RecordId>;
    fn insert_many(&self, table: &str, records: &[Record]) -> DbmsResult<u64>;
    /// An empty projection returns every field.
    fn find(&self, table: &str, filter: &Filter, projection: &[&str]) -> DbmsResult<Vec<Record>>;
    fn find_one(&self, table: &str, filter: &Filter, projection: &[&str])
        -> DbmsResult<Option<Record>>;
    fn update(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64>;
    fn remove(&self, table: &str, filter: &Filter) -> DbmsResult<u64>;

    /// Same as `update`, which already patches every matching record.
    fn update_many(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64> {
        self.update(table, filter, patch)
    }

    /// Same as `remove`.
    fn delete(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        self.remove(table, filter)
    }

    fn count(&self, table: &str, filter: &Filter) -> DbmsResult<u64>;
    /// Sum of `column` over matching rows; `0.0` when nothing matches.
    fn sum(&self, table: &str, column: &str, filter: &Filter) -> DbmsResult<f64>;
    /// Runs a raw statement with positional parameters.
    fn execute(&self, statement: &str, params: &[Value]) -> DbmsResult<ExecuteResult>;

    /// Runs a store-specific administrative command such as
    /// `("drop", "users")`; `options` follow the command key.
    fn run_command(&self, _command: &str, _argument: &Value, _options: &Record) -> DbmsResult<Record> {
        Err(DbmsError::unsupported(self.kind(), "run_command"))
    }

    /// Creates the table if it does not exist.
    fn ensure_table(&self, spec: &TableSpec) -> DbmsResult<()>;

    async fn connect_async(&self) -> DbmsResult<()>;
    async fn disconnect_async(&self) -> DbmsResult<()>;
    async fn insert_async(&self, table: &str, record: &Record) -> DbmsResult<RecordId>;
    async fn insert_many_async(&self, table: &str, records: &[Record]) -> DbmsResult<u64>;
    async fn find_async(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> DbmsResult<Vec<Record>>;
    async fn find_one_async(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> DbmsResult<Option<Record>>;
    async fn update_async(&self, table: &str, filter: &Filter, patch: &Record) -> DbmsResult<u64>;
    async fn remove_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64>;

    async fn update_many_async(
        &self,
        table: &str,
        filter: &Filter,
        patch: &Record,
    ) -> DbmsResult<u64> {
        self.update_async(table, filter, patch).await
    }

    async fn delete_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64> {
        self.remove_async(table, filter).await
    }

    async fn count_async(&self, table: &str, filter: &Filter) -> DbmsResult<u64>;
    async fn sum_async(&self, table: &str, column: &str, filter: &Filter) -> DbmsResult<f64>;
    async fn execute_async(&self, statement: &str, params: &[Value]) -> DbmsResult<ExecuteResult>;

    async fn run_command_async(
        &self,
        _command: &str,
        _argument: &Value,
        _options: &Record,
    ) -> DbmsResult<Record> {
        Err(DbmsError::unsupported(self.kind(), "run_command"))
    }

    async fn ensure_table_async(&self, spec: &TableSpec) -> DbmsResult<()>;
}

pub(crate) fn owned_projection(projection: &[&str]) -> Vec<String> {
    projection.iter().map(|field| field.to_string()).collect()
}

pub(crate) fn borrowed_projection(projection: &[String]) -> Vec<&str> {
    projection.iter().map(String::as_str).collect()
}
