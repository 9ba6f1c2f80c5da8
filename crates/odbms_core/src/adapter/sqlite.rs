//! SQLite driver on top of `rusqlite`.
//!
//! # Responsibility
//! - Open file or in-memory databases with the pragmas the adapter relies on.
//! - Bind canonical scalars and read rows back as driver scalars.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON` and a busy timeout.
//! - All connections of one in-memory pool share a single database.
//! - Missing database files are created only when `create_if_missing` is set.

use super::sql::{RunOutcome, SqlDriver};
use crate::config::{BackendKind, ConnectionConfig};
use crate::error::{ConnectionError, ConnectionErrorKind, DbmsResult, DriverError, NormalizationError};
use crate::normalize::relational::{NativeRow, SqlParam};
use crate::pool::ConnectionManager;
use crate::sql::Dialect;
use log::{error, info};
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

const MEMORY_DATABASE: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    File(PathBuf),
    /// Shared-cache URI private to one pool.
    Memory(String),
}

#[derive(Debug, Clone)]
pub struct SqliteDriver {
    target: Target,
    create_if_missing: bool,
}

impl SqliteDriver {
    pub fn new(config: &ConnectionConfig) -> Self {
        let target = if config.database == MEMORY_DATABASE {
            Target::Memory(format!(
                "file:odbms-mem-{}?mode=memory&cache=shared",
                Uuid::new_v4().simple()
            ))
        } else {
            Target::File(PathBuf::from(&config.database))
        };
        Self {
            target,
            create_if_missing: config.create_if_missing,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.target, Target::Memory(_))
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let base = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match &self.target {
            Target::Memory(uri) => Connection::open_with_flags(
                uri,
                base | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_SHARED_CACHE,
            ),
            Target::File(path) => {
                let flags = if self.create_if_missing {
                    base | OpenFlags::SQLITE_OPEN_CREATE
                } else {
                    base
                };
                Connection::open_with_flags(path, flags)
            }
        }
    }

    fn mode(&self) -> &'static str {
        if self.is_memory() {
            "memory"
        } else {
            "file"
        }
    }
}

fn bootstrap_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn to_sqlite(param: &SqlParam) -> SqliteValue {
    match param {
        SqlParam::Null => SqliteValue::Null,
        SqlParam::Bool(flag) => SqliteValue::Integer(i64::from(*flag)),
        SqlParam::Int(number) => SqliteValue::Integer(*number),
        SqlParam::Float(number) => SqliteValue::Real(*number),
        SqlParam::Text(text) => SqliteValue::Text(text.clone()),
    }
}

fn from_sqlite(column: &str, value: ValueRef<'_>) -> Result<SqlParam, NormalizationError> {
    Ok(match value {
        ValueRef::Null => SqlParam::Null,
        ValueRef::Integer(number) => SqlParam::Int(number),
        ValueRef::Real(number) => SqlParam::Float(number),
        ValueRef::Text(bytes) => SqlParam::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => {
            return Err(NormalizationError::UnsupportedColumnType {
                column: column.to_string(),
                type_name: "BLOB".to_string(),
            })
        }
    })
}

impl ConnectionManager for SqliteDriver {
    type Connection = Connection;

    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn connect(&self) -> DbmsResult<Connection> {
        let started_at = Instant::now();
        let opened = self
            .open()
            .and_then(|conn| bootstrap_connection(&conn).map(|()| conn));
        match opened {
            Ok(conn) => {
                info!(
                    "event=db_open module=sqlite status=ok mode={} duration_ms={}",
                    self.mode(),
                    started_at.elapsed().as_millis()
                );
                Ok(conn)
            }
            Err(err) => {
                let missing = matches!(&self.target, Target::File(path) if !path.exists());
                error!(
                    "event=db_open module=sqlite status=error mode={} duration_ms={} error_code={} error={}",
                    self.mode(),
                    started_at.elapsed().as_millis(),
                    if missing { "db_missing" } else { "db_open_failed" },
                    err
                );
                let kind = if missing && !self.create_if_missing {
                    ConnectionErrorKind::MissingDatabase
                } else {
                    ConnectionErrorKind::ConnectFailed
                };
                Err(ConnectionError::new(BackendKind::Sqlite, kind, err.to_string()).into())
            }
        }
    }

    fn is_alive(&self, conn: &mut Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

impl SqlDriver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn fetch(
        &self,
        conn: &mut Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<NativeRow>, DriverError> {
        let mut statement = conn.prepare(sql)?;
        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = statement.query(params_from_iter(params.iter().map(to_sqlite)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut native = Vec::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                native.push((column.clone(), from_sqlite(column, row.get_ref(index)?)?));
            }
            out.push(native);
        }
        Ok(out)
    }

    fn run(
        &self,
        conn: &mut Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<RunOutcome, DriverError> {
        let rows_affected = if params.is_empty() && sql.contains(';') {
            conn.execute_batch(sql)?;
            conn.changes() as u64
        } else {
            conn.execute(sql, params_from_iter(params.iter().map(to_sqlite)))? as u64
        };
        Ok(RunOutcome {
            rows_affected,
            last_insert_id: Some(conn.last_insert_rowid()),
        })
    }
}
