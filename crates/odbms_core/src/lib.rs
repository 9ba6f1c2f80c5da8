//! Backend-agnostic persistence core.
//! One adapter contract over SQLite, MySQL, PostgreSQL and MongoDB, with a
//! schema-driven entity layer on top.

pub mod adapter;
pub mod config;
pub mod dbms;
pub mod error;
pub mod filter;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod pool;
pub mod sql;
pub mod value;
pub mod worker;

pub use adapter::{Adapter, ExecuteResult, Family};
pub use config::{BackendKind, ConnectionConfig};
pub use dbms::Dbms;
pub use error::{
    ConnectionError, ConnectionErrorKind, DbmsError, DbmsResult, NormalizationError,
    ValidationError,
};
pub use filter::{Condition, Filter, Operator};
pub use logging::{default_log_level, init_logging, logging_status, LogTarget, LoggingConfig};
pub use model::{
    Entity, Field, FieldKind, HookPoint, Model, ModelSchema, Related, RelationKind,
    Relationship, SaveAction,
};
pub use pool::{ConnectionManager, Pool, PoolKey, PoolRegistry, PooledConnection};
pub use value::{record, Record, RecordId, Value};
pub use worker::Worker;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
