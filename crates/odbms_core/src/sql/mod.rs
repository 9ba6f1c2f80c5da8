//! SQL text generation shared by the relational adapters.
//!
//! # Responsibility
//! - Describe per-engine syntax differences (`Dialect`).
//! - Validate and quote identifiers before they reach SQL text.
//!
//! # Invariants
//! - Only identifiers matching `IDENTIFIER_PATTERN` are ever interpolated;
//!   every value travels as a bound parameter or the literal `NULL`.

pub mod ddl;
pub mod statement;

use crate::config::BackendKind;
use crate::error::NormalizationError;
use once_cell::sync::Lazy;
use regex::Regex;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(IDENTIFIER_PATTERN).expect("valid identifier regex"));

/// Relational engine syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    pub fn backend(self) -> BackendKind {
        match self {
            Self::Sqlite => BackendKind::Sqlite,
            Self::MySql => BackendKind::MySql,
            Self::Postgres => BackendKind::PostgreSql,
        }
    }

    /// Placeholder for the `index`-th (1-based) bound parameter.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::Sqlite | Self::MySql => "?".to_string(),
        }
    }

    /// Validates `name` and wraps it in the engine's identifier quotes.
    pub fn quote(self, name: &str) -> Result<String, NormalizationError> {
        validate_identifier(name)?;
        Ok(match self {
            Self::MySql => format!("`{name}`"),
            Self::Sqlite | Self::Postgres => format!("\"{name}\""),
        })
    }

    /// Whether inserts report the new key through `RETURNING`.
    pub fn supports_returning_id(self) -> bool {
        matches!(self, Self::Postgres)
    }
}

pub fn validate_identifier(name: &str) -> Result<(), NormalizationError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(NormalizationError::InvalidIdentifier(name.to_string()))
    }
}

/// Whether a raw statement produces a result set.
pub fn returns_rows(statement: &str) -> bool {
    let head = statement
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE" | "DESC" | "VALUES"
    ) || statement.to_ascii_uppercase().contains(" RETURNING ")
}

/// Whether a raw statement is an insert (and may report a new key).
pub fn is_insert(statement: &str) -> bool {
    statement
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"))
}
