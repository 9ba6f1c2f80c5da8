//! MySQL driver on top of `sqlx`, driven by the shared worker runtime.
//!
//! A connect attempt that fails with "Unknown database" is retried once
//! without selecting a database, to tell a missing database apart from an
//! unreachable server.

use super::sql::{RunOutcome, SqlDriver};
use crate::config::{BackendKind, ConnectionConfig};
use crate::error::{ConnectionError, ConnectionErrorKind, DbmsResult, DriverError, NormalizationError};
use crate::normalize::relational::{format_timestamp, NativeRow, SqlParam};
use crate::pool::ConnectionManager;
use crate::sql::{statement, Dialect};
use crate::worker::Worker;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{error, info, warn};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::types::{Decimal, JsonValue};
use sqlx::{Column, Connection, Executor, MySql, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Instant;

const UNKNOWN_DATABASE: &str = "Unknown database";

#[derive(Clone)]
pub struct MySqlDriver {
    config: ConnectionConfig,
    worker: Arc<Worker>,
}

impl MySqlDriver {
    pub fn new(config: ConnectionConfig, worker: Arc<Worker>) -> Self {
        Self { config, worker }
    }

    fn options(&self, database: Option<&str>) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port_for(BackendKind::MySql).unwrap_or(3306));
        if let Some(database) = database {
            options = options.database(database);
        }
        if let Some(username) = &self.config.username {
            options = options.username(username);
        }
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        options
    }

    fn connect_error(&self, kind: ConnectionErrorKind, detail: impl Into<String>) -> ConnectionError {
        ConnectionError::new(BackendKind::MySql, kind, detail)
    }

    async fn open(&self) -> DbmsResult<MySqlConnection> {
        let database = self.config.database.as_str();
        let err = match MySqlConnection::connect_with(&self.options(Some(database))).await {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };
        if !is_unknown_database(&err) {
            return Err(self
                .connect_error(ConnectionErrorKind::ConnectFailed, err.to_string())
                .into());
        }

        warn!(
            "event=db_open module=mysql status=retry error_code=db_missing database={}",
            database
        );
        let mut server = MySqlConnection::connect_with(&self.options(None))
            .await
            .map_err(|err| self.connect_error(ConnectionErrorKind::ConnectFailed, err.to_string()))?;
        if !self.config.create_database {
            let _ = server.close().await;
            return Err(self
                .connect_error(
                    ConnectionErrorKind::MissingDatabase,
                    format!("database `{database}` does not exist"),
                )
                .into());
        }

        let create = statement::create_database(Dialect::MySql, database)?;
        server
            .execute(create.as_str())
            .await
            .map_err(|err| self.connect_error(ConnectionErrorKind::ConnectFailed, err.to_string()))?;
        let _ = server.close().await;
        info!("event=db_create module=mysql status=ok database={database}");

        MySqlConnection::connect_with(&self.options(Some(database)))
            .await
            .map_err(|err| self.connect_error(ConnectionErrorKind::ConnectFailed, err.to_string()).into())
    }
}

fn is_unknown_database(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains(UNKNOWN_DATABASE),
        _ => false,
    }
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &[SqlParam],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(flag) => query.bind(*flag),
            SqlParam::Int(number) => query.bind(*number),
            SqlParam::Float(number) => query.bind(*number),
            SqlParam::Text(text) => query.bind(text.clone()),
        };
    }
    query
}

fn unsigned(value: u64) -> SqlParam {
    i64::try_from(value)
        .map(SqlParam::Int)
        .unwrap_or(SqlParam::Float(value as f64))
}

fn decode_row(row: &MySqlRow) -> Result<NativeRow, DriverError> {
    let mut native = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        if row.try_get_raw(index)?.is_null() {
            native.push((name, SqlParam::Null));
            continue;
        }
        let value = match column.type_info().name() {
            "BOOLEAN" => SqlParam::Bool(row.try_get(index)?),
            "TINYINT" => SqlParam::Int(row.try_get::<i8, _>(index)?.into()),
            "SMALLINT" => SqlParam::Int(row.try_get::<i16, _>(index)?.into()),
            "INT" | "MEDIUMINT" => SqlParam::Int(row.try_get::<i32, _>(index)?.into()),
            "BIGINT" => SqlParam::Int(row.try_get(index)?),
            "TINYINT UNSIGNED" => SqlParam::Int(row.try_get::<u8, _>(index)?.into()),
            "SMALLINT UNSIGNED" => SqlParam::Int(row.try_get::<u16, _>(index)?.into()),
            "INT UNSIGNED" | "MEDIUMINT UNSIGNED" => {
                SqlParam::Int(row.try_get::<u32, _>(index)?.into())
            }
            "BIGINT UNSIGNED" => unsigned(row.try_get::<u64, _>(index)?),
            "FLOAT" => SqlParam::Float(row.try_get::<f32, _>(index)?.into()),
            "DOUBLE" => SqlParam::Float(row.try_get(index)?),
            "DECIMAL" => {
                let decimal: Decimal = row.try_get(index)?;
                SqlParam::Float(decimal.to_string().parse()?)
            }
            "VARCHAR" | "CHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
            | "SET" => SqlParam::Text(row.try_get(index)?),
            "JSON" => SqlParam::Text(row.try_get::<JsonValue, _>(index)?.to_string()),
            "TIMESTAMP" => {
                SqlParam::Text(format_timestamp(&row.try_get::<DateTime<Utc>, _>(index)?))
            }
            "DATETIME" => SqlParam::Text(format_timestamp(
                &row.try_get::<NaiveDateTime, _>(index)?.and_utc(),
            )),
            "DATE" => SqlParam::Text(row.try_get::<NaiveDate, _>(index)?.to_string()),
            other => {
                return Err(Box::new(NormalizationError::UnsupportedColumnType {
                    column: name,
                    type_name: other.to_string(),
                }))
            }
        };
        native.push((name, value));
    }
    Ok(native)
}

impl ConnectionManager for MySqlDriver {
    type Connection = MySqlConnection;

    fn backend(&self) -> BackendKind {
        BackendKind::MySql
    }

    fn connect(&self) -> DbmsResult<MySqlConnection> {
        let started_at = Instant::now();
        let result = self.worker.block_on(self.open())?;
        match &result {
            Ok(_) => info!(
                "event=db_open module=mysql status=ok duration_ms={}",
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=db_open module=mysql status=error duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    fn is_alive(&self, conn: &mut MySqlConnection) -> bool {
        matches!(self.worker.block_on(conn.ping()), Ok(Ok(())))
    }

    fn close(&self, conn: MySqlConnection) {
        let _ = self.worker.block_on(conn.close());
    }
}

impl SqlDriver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn fetch(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<NativeRow>, DriverError> {
        let rows = self
            .worker
            .block_on(bind_params(sqlx::query(sql), params).fetch_all(&mut *conn))??;
        rows.iter().map(decode_row).collect()
    }

    fn run(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<RunOutcome, DriverError> {
        // Parameterless statements use the text protocol, which also accepts
        // statements MySQL cannot prepare (triggers, CREATE DATABASE).
        let result = if params.is_empty() {
            self.worker.block_on(conn.execute(sql))??
        } else {
            self.worker
                .block_on(bind_params(sqlx::query(sql), params).execute(&mut *conn))??
        };
        Ok(RunOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: i64::try_from(result.last_insert_id()).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_unsigned_values_degrade_to_float() {
        assert_eq!(unsigned(5), SqlParam::Int(5));
        assert!(matches!(unsigned(u64::MAX), SqlParam::Float(_)));
    }

    #[test]
    fn options_skip_database_for_server_level_retry() {
        let driver = MySqlDriver::new(ConnectionConfig::new("shop"), Arc::new(Worker::new(1)));
        assert_eq!(driver.options(None).get_database(), None);
        assert_eq!(driver.options(Some("shop")).get_database(), Some("shop"));
        assert_eq!(driver.options(None).get_port(), 3306);
    }
}
