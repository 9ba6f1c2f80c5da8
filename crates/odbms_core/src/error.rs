//! Error taxonomy shared by every layer of the crate.
//!
//! # Responsibility
//! - Give callers one error type for adapter, pool, normalizer and model calls.
//! - Carry backend/operation/table context for driver failures.
//!
//! # Invariants
//! - Validation failures are raised before any I/O is issued.
//! - "Not found" is never an error; lookups return `Option`.
//! - No variant implies that an automatic retry happened.

use crate::config::BackendKind;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type DbmsResult<T> = Result<T, DbmsError>;

/// Boxed native driver error.
pub type DriverError = Box<dyn Error + Send + Sync + 'static>;

/// Top-level error for all persistence operations.
#[derive(Debug)]
pub enum DbmsError {
    /// A model or adapter call was issued before `Dbms::initialize`.
    NotInitialized,
    /// `Dbms::initialize` was called on an already initialized handle.
    AlreadyInitialized(BackendKind),
    Connection(ConnectionError),
    Validation(ValidationError),
    Normalization(NormalizationError),
    UnsupportedOperation {
        backend: BackendKind,
        operation: &'static str,
    },
    /// Native driver failure wrapped with call-site context.
    Operation {
        backend: BackendKind,
        operation: &'static str,
        table: Option<String>,
        source: DriverError,
    },
    /// Unknown model name or relationship misuse.
    Model(String),
    /// A lifecycle hook rejected the operation.
    Hook(String),
    /// Worker runtime task failed to complete (panic or shutdown).
    Worker(String),
}

impl DbmsError {
    pub(crate) fn operation(
        backend: BackendKind,
        operation: &'static str,
        table: Option<&str>,
        source: impl Into<DriverError>,
    ) -> Self {
        Self::Operation {
            backend,
            operation,
            table: table.map(str::to_string),
            source: source.into(),
        }
    }

    pub(crate) fn unsupported(backend: BackendKind, operation: &'static str) -> Self {
        Self::UnsupportedOperation { backend, operation }
    }

    /// Returns `true` when this error reports a missing relational database.
    pub fn is_missing_database(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError {
                kind: ConnectionErrorKind::MissingDatabase,
                ..
            })
        )
    }
}

impl Display for DbmsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "database not initialized"),
            Self::AlreadyInitialized(backend) => {
                write!(f, "database already initialized with backend `{backend}`")
            }
            Self::Connection(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Normalization(err) => write!(f, "{err}"),
            Self::UnsupportedOperation { backend, operation } => {
                write!(f, "operation `{operation}` is not supported by `{backend}`")
            }
            Self::Operation {
                backend,
                operation,
                table,
                source,
            } => match table {
                Some(table) => write!(f, "{backend} {operation} on `{table}` failed: {source}"),
                None => write!(f, "{backend} {operation} failed: {source}"),
            },
            Self::Model(message) => write!(f, "model error: {message}"),
            Self::Hook(message) => write!(f, "hook rejected operation: {message}"),
            Self::Worker(message) => write!(f, "worker task failed: {message}"),
        }
    }
}

impl Error for DbmsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connection(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Normalization(err) => Some(err),
            Self::Operation { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<ConnectionError> for DbmsError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

impl From<ValidationError> for DbmsError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<NormalizationError> for DbmsError {
    fn from(value: NormalizationError) -> Self {
        Self::Normalization(value)
    }
}

/// What went wrong while establishing or checking out a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    ConnectFailed,
    /// Server reachable, database absent.
    MissingDatabase,
    PoolTimeout,
    PoolClosed,
    /// A dead connection could not be replaced.
    ReplacementFailed,
    NotConnected,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub backend: BackendKind,
    pub kind: ConnectionErrorKind,
    pub detail: String,
}

impl ConnectionError {
    pub fn new(backend: BackendKind, kind: ConnectionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            backend,
            kind,
            detail: detail.into(),
        }
    }
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self.kind {
            ConnectionErrorKind::ConnectFailed => "connect failed",
            ConnectionErrorKind::MissingDatabase => "database does not exist",
            ConnectionErrorKind::PoolTimeout => "timed out waiting for a pooled connection",
            ConnectionErrorKind::PoolClosed => "connection pool is closed",
            ConnectionErrorKind::ReplacementFailed => "dead connection could not be replaced",
            ConnectionErrorKind::NotConnected => "adapter is not connected",
        };
        write!(f, "{} {label}: {}", self.backend, self.detail)
    }
}

impl Error for ConnectionError {}

/// Field constraint or required-field violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation error for field `{}`: {}", self.field, self.message)
    }
}

impl Error for ValidationError {}

/// A canonical value that cannot be encoded for, or decoded from, a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    /// List element contains the reserved relational separator.
    ReservedSeparator { key: String, element: String },
    /// Value shape not representable in the target encoding.
    Unrepresentable { key: String, reason: String },
    InvalidIdentifier(String),
    InvalidObjectId { key: String, value: String },
    /// Operator filter with a malformed operand or nesting.
    InvalidFilter(String),
    UnsupportedColumnType { column: String, type_name: String },
}

impl Display for NormalizationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReservedSeparator { key, element } => write!(
                f,
                "list value for `{key}` has element `{element}` containing the reserved separator"
            ),
            Self::Unrepresentable { key, reason } => {
                write!(f, "value for `{key}` cannot be normalized: {reason}")
            }
            Self::InvalidIdentifier(name) => write!(f, "invalid SQL identifier `{name}`"),
            Self::InvalidObjectId { key, value } => {
                write!(f, "value `{value}` for `{key}` is not a valid object id")
            }
            Self::InvalidFilter(message) => write!(f, "invalid filter: {message}"),
            Self::UnsupportedColumnType { column, type_name } => {
                write!(f, "column `{column}` has unsupported type `{type_name}`")
            }
        }
    }
}

impl Error for NormalizationError {}
