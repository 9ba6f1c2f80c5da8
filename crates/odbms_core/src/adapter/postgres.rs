//! PostgreSQL driver on top of `sqlx`, driven by the shared worker runtime.
//!
//! # Responsibility
//! - Open connections, detecting a missing database (SQLSTATE `3D000`)
//!   with one retry against the `postgres` maintenance database.
//! - Bind driver scalars and decode rows by column type name.
//!
//! # Invariants
//! - `CREATE DATABASE` is only issued when `create_database` is enabled.

use super::sql::{RunOutcome, SqlDriver};
use crate::config::{BackendKind, ConnectionConfig};
use crate::error::{ConnectionError, ConnectionErrorKind, DbmsResult, DriverError, NormalizationError};
use crate::normalize::relational::{format_timestamp, NativeRow, SqlParam};
use crate::pool::ConnectionManager;
use crate::sql::{statement, Dialect};
use crate::worker::Worker;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{error, info, warn};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::types::{Decimal, JsonValue, Uuid};
use sqlx::{Column, Connection, Executor, Postgres, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Instant;

const MISSING_DATABASE_CODE: &str = "3D000";
const MAINTENANCE_DATABASE: &str = "postgres";

#[derive(Clone)]
pub struct PostgresDriver {
    config: ConnectionConfig,
    worker: Arc<Worker>,
}

impl PostgresDriver {
    pub fn new(config: ConnectionConfig, worker: Arc<Worker>) -> Self {
        Self { config, worker }
    }

    fn options(&self, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port_for(BackendKind::PostgreSql).unwrap_or(5432))
            .database(database);
        if let Some(username) = &self.config.username {
            options = options.username(username);
        }
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        options
    }

    fn connect_error(&self, kind: ConnectionErrorKind, detail: impl Into<String>) -> ConnectionError {
        ConnectionError::new(BackendKind::PostgreSql, kind, detail)
    }

    async fn open(&self) -> DbmsResult<PgConnection> {
        let database = self.config.database.as_str();
        let err = match PgConnection::connect_with(&self.options(database)).await {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };
        if !is_missing_database(&err) {
            return Err(self
                .connect_error(ConnectionErrorKind::ConnectFailed, err.to_string())
                .into());
        }

        warn!(
            "event=db_open module=postgres status=retry error_code=db_missing database={}",
            database
        );
        let mut server = PgConnection::connect_with(&self.options(MAINTENANCE_DATABASE))
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

        let create = statement::create_database(Dialect::Postgres, database)?;
        server
            .execute(create.as_str())
            .await
            .map_err(|err| self.connect_error(ConnectionErrorKind::ConnectFailed, err.to_string()))?;
        let _ = server.close().await;
        info!("event=db_create module=postgres status=ok database={database}");

        PgConnection::connect_with(&self.options(database))
            .await
            .map_err(|err| self.connect_error(ConnectionErrorKind::ConnectFailed, err.to_string()).into())
    }
}

fn is_missing_database(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(MISSING_DATABASE_CODE),
        _ => false,
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlParam],
) -> Query<'q, Postgres, PgArguments> {
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

fn decode_row(row: &PgRow) -> Result<NativeRow, DriverError> {
    let mut native = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        if row.try_get_raw(index)?.is_null() {
            native.push((name, SqlParam::Null));
            continue;
        }
        let value = match column.type_info().name() {
            "BOOL" => SqlParam::Bool(row.try_get(index)?),
            "INT2" => SqlParam::Int(row.try_get::<i16, _>(index)?.into()),
            "INT4" => SqlParam::Int(row.try_get::<i32, _>(index)?.into()),
            "INT8" => SqlParam::Int(row.try_get(index)?),
            "FLOAT4" => SqlParam::Float(row.try_get::<f32, _>(index)?.into()),
            "FLOAT8" => SqlParam::Float(row.try_get(index)?),
            "NUMERIC" => {
                let decimal: Decimal = row.try_get(index)?;
                SqlParam::Float(decimal.to_string().parse()?)
            }
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => {
                SqlParam::Text(row.try_get(index)?)
            }
            "UUID" => SqlParam::Text(row.try_get::<Uuid, _>(index)?.to_string()),
            "JSON" | "JSONB" => SqlParam::Text(row.try_get::<JsonValue, _>(index)?.to_string()),
            "TIMESTAMPTZ" => {
                SqlParam::Text(format_timestamp(&row.try_get::<DateTime<Utc>, _>(index)?))
            }
            "TIMESTAMP" => SqlParam::Text(format_timestamp(
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

impl ConnectionManager for PostgresDriver {
    type Connection = PgConnection;

    fn backend(&self) -> BackendKind {
        BackendKind::PostgreSql
    }

    fn connect(&self) -> DbmsResult<PgConnection> {
        let started_at = Instant::now();
        let result = self.worker.block_on(self.open())?;
        match &result {
            Ok(_) => info!(
                "event=db_open module=postgres status=ok duration_ms={}",
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=db_open module=postgres status=error duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    fn is_alive(&self, conn: &mut PgConnection) -> bool {
        matches!(self.worker.block_on(conn.ping()), Ok(Ok(())))
    }

    fn close(&self, conn: PgConnection) {
        let _ = self.worker.block_on(conn.close());
    }
}

impl SqlDriver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn fetch(
        &self,
        conn: &mut PgConnection,
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
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<RunOutcome, DriverError> {
        let result = if params.is_empty() {
            self.worker.block_on(conn.execute(sql))??
        } else {
            self.worker
                .block_on(bind_params(sqlx::query(sql), params).execute(&mut *conn))??
        };
        Ok(RunOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_fall_back_to_default_port() {
        let worker = Arc::new(Worker::new(1));
        let driver = PostgresDriver::new(
            ConnectionConfig::new("shop").with_credentials("app", "secret"),
            worker,
        );
        let options = driver.options("shop");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("shop"));
        assert_eq!(options.get_username(), "app");
    }
}
