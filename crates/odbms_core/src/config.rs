//! Backend selection and connection settings.
//!
//! # Responsibility
//! - Name the supported backends and their default ports.
//! - Hold the connection settings every adapter reads from.
//!
//! # Invariants
//! - `database` is always present; other fields fall back to defaults.
//! - Secrets never appear in `Display`/log output (see `redacted`).

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Storage backends understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "mongo")]
    MongoDb,
    Sqlite,
    MySql,
    #[serde(alias = "postgres")]
    PostgreSql,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MongoDb => "mongodb",
            Self::Sqlite => "sqlite",
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
        }
    }

    /// Port used when the configuration leaves it empty.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::MongoDb => Some(27017),
            Self::Sqlite => None,
            Self::MySql => Some(3306),
            Self::PostgreSql => Some(5432),
        }
    }

    pub fn is_relational(self) -> bool {
        !matches!(self, Self::MongoDb)
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(Self::MongoDb),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mysql" => Ok(Self::MySql),
            "postgresql" | "postgres" | "pg" => Ok(Self::PostgreSql),
            other => Err(format!(
                "unsupported database type `{other}`; expected mongodb|sqlite|mysql|postgresql"
            )),
        }
    }
}

/// Connection settings shared by all backends; unused fields are ignored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: Option<u16>,
    /// Database name, or file path / `:memory:` for SQLite.
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: usize,
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,
    pub worker_threads: usize,
    /// Issue `CREATE DATABASE` when the server reports it missing.
    pub create_database: bool,
    /// SQLite only: create the database file when absent.
    pub create_if_missing: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            database: String::new(),
            username: None,
            password: None,
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            worker_threads: DEFAULT_WORKER_THREADS,
            create_database: false,
            create_if_missing: true,
        }
    }
}

impl ConnectionConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_create_database(mut self, enabled: bool) -> Self {
        self.create_database = enabled;
        self
    }

    /// Port to dial for `kind`, falling back to the backend default.
    pub fn port_for(&self, kind: BackendKind) -> Option<u16> {
        self.port.or_else(|| kind.default_port())
    }

    /// Checks the fields every backend requires.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.trim().is_empty() {
            return Err("connection config requires a database".to_string());
        }
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".to_string());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be at least 1".to_string());
        }
        Ok(())
    }

    /// One-line description safe for logs.
    pub fn redacted(&self, kind: BackendKind) -> String {
        if kind == BackendKind::Sqlite {
            return format!("sqlite:{}", self.database);
        }
        let user = self.username.as_deref().unwrap_or("-");
        let port = self
            .port_for(kind)
            .map(|port| port.to_string())
            .unwrap_or_default();
        format!("{kind}://{user}:***@{}:{port}/{}", self.host, self.database)
    }

    /// Reads `<PREFIX>_DBMS`, `_HOST`, `_PORT`, `_DATABASE`, `_USERNAME`,
    /// `_PASSWORD` and `_POOL_SIZE` from the process environment.
    pub fn from_env(prefix: &str) -> Result<(BackendKind, Self), String> {
        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();

        let kind = var("DBMS")
            .ok_or_else(|| format!("{prefix}_DBMS is not set"))?
            .parse::<BackendKind>()?;
        let database = var("DATABASE").ok_or_else(|| format!("{prefix}_DATABASE is not set"))?;

        let mut config = Self::new(database);
        if let Some(host) = var("HOST") {
            config.host = host;
        }
        if let Some(port) = var("PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|err| format!("invalid {prefix}_PORT `{port}`: {err}"))?;
            config.port = Some(port);
        }
        config.username = var("USERNAME");
        config.password = var("PASSWORD");
        if let Some(size) = var("POOL_SIZE") {
            config.pool_size = size
                .parse::<usize>()
                .map_err(|err| format!("invalid {prefix}_POOL_SIZE `{size}`: {err}"))?;
        }

        config.validate()?;
        Ok((kind, config))
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("pool_size", &self.pool_size)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("worker_threads", &self.worker_threads)
            .field("create_database", &self.create_database)
            .field("create_if_missing", &self.create_if_missing)
            .finish()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
