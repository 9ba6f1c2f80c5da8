//! Parameterized statement builders for CRUD and aggregates.
//!
//! # Responsibility
//! - Flatten canonical filters into `WHERE` predicates.
//! - Build insert/select/update/delete/count/sum statements.
//!
//! # Invariants
//! - Equality-only filters produce exactly one clause per key joined by
//!   `AND`.
//! - `$in`/`$nin` bind one parameter per non-null element.
//! - Null values are written as `NULL` / `IS NULL` and never bound, so
//!   every bound parameter has a concrete type.
//! - `$ne` and `$nin` match rows whose column is null, like the document
//!   store does.

use super::Dialect;
use crate::error::NormalizationError;
use crate::filter::{Condition, Filter, Operator};
use crate::normalize::relational::{encode_element, encode_value, SqlParam};
use crate::value::{Record, Value};

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

struct Binder {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl Binder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        if param.is_null() {
            return "NULL".to_string();
        }
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

fn comparison_token(op: Operator) -> &'static str {
    match op {
        Operator::Lt => "<",
        Operator::Lte => "<=",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Ne => "<>",
        Operator::In => "IN",
        Operator::Nin => "NOT IN",
    }
}

fn operator_clause(
    binder: &mut Binder,
    key: &str,
    column: &str,
    op: Operator,
    operand: &Value,
) -> Result<String, NormalizationError> {
    if op.is_set_operator() {
        let items = operand.as_list().ok_or_else(|| {
            NormalizationError::InvalidFilter(format!("`{op}` on `{key}` requires a list operand"))
        })?;
        return set_clause(binder, key, column, op, items);
    }

    let param = encode_value(key, operand)?;
    if param.is_null() {
        return match op {
            Operator::Ne => Ok(format!("{column} IS NOT NULL")),
            _ => Err(NormalizationError::InvalidFilter(format!(
                "`{op}` on `{key}` cannot compare against null"
            ))),
        };
    }
    let placeholder = binder.bind(param);
    if op == Operator::Ne {
        // Null and missing values differ from every concrete operand.
        return Ok(format!("({column} <> {placeholder} OR {column} IS NULL)"));
    }
    Ok(format!("{column} {} {placeholder}", comparison_token(op)))
}

/// `$in`/`$nin`: one placeholder per non-null element; a null element
/// becomes an `IS NULL` test, and `$nin` without one keeps null rows.
fn set_clause(
    binder: &mut Binder,
    key: &str,
    column: &str,
    op: Operator,
    items: &[Value],
) -> Result<String, NormalizationError> {
    let mut placeholders = Vec::with_capacity(items.len());
    let mut has_null = false;
    for item in items {
        let param = encode_element(key, item)?;
        if param.is_null() {
            has_null = true;
        } else {
            placeholders.push(binder.bind(param));
        }
    }

    let listed = (!placeholders.is_empty()).then(|| {
        format!(
            "{column} {} ({})",
            comparison_token(op),
            placeholders.join(", ")
        )
    });
    Ok(match (op, listed, has_null) {
        // Empty $in matches nothing, empty $nin matches everything.
        (Operator::In, None, false) => "1 = 0".to_string(),
        (_, None, false) => "1 = 1".to_string(),
        (Operator::In, None, true) => format!("{column} IS NULL"),
        (_, None, true) => format!("{column} IS NOT NULL"),
        (Operator::In, Some(listed), false) => listed,
        (Operator::In, Some(listed), true) => format!("({listed} OR {column} IS NULL)"),
        (_, Some(listed), false) => format!("({listed} OR {column} IS NULL)"),
        (_, Some(listed), true) => format!("({listed} AND {column} IS NOT NULL)"),
    })
}

fn where_clause(binder: &mut Binder, filter: &Filter) -> Result<String, NormalizationError> {
    filter.check()?;
    let dialect = binder.dialect;
    let mut clauses = Vec::with_capacity(filter.len());
    for (key, condition) in filter {
        let column = dialect.quote(key)?;
        match condition {
            Condition::Eq(value) => {
                let param = encode_value(key, value)?;
                if param.is_null() {
                    clauses.push(format!("{column} IS NULL"));
                } else {
                    let placeholder = binder.bind(param);
                    clauses.push(format!("{column} = {placeholder}"));
                }
            }
            Condition::Ops(ops) => {
                for (op, operand) in ops {
                    clauses.push(operator_clause(binder, key, &column, *op, operand)?);
                }
            }
        }
    }
    if clauses.is_empty() {
        return Ok(String::new());
    }
    Ok(format!(" WHERE {}", clauses.join(" AND ")))
}

/// `SELECT` with optional projection and row limit.
pub fn select(
    dialect: Dialect,
    table: &str,
    filter: &Filter,
    projection: &[&str],
    limit: Option<usize>,
) -> Result<Statement, NormalizationError> {
    let mut binder = Binder::new(dialect);
    let columns = if projection.is_empty() {
        "*".to_string()
    } else {
        projection
            .iter()
            .map(|column| dialect.quote(column))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ")
    };
    let mut sql = format!("SELECT {columns} FROM {}", dialect.quote(table)?);
    sql.push_str(&where_clause(&mut binder, filter)?);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok(binder.finish(sql))
}

/// `INSERT` of one record; a null `id` is left to the engine.
pub fn insert(dialect: Dialect, table: &str, record: &Record) -> Result<Statement, NormalizationError> {
    let mut binder = Binder::new(dialect);
    let table = dialect.quote(table)?;
    let mut columns = Vec::with_capacity(record.len());
    let mut values = Vec::with_capacity(record.len());
    for (key, value) in record {
        if key == "id" && value.is_null() {
            continue;
        }
        columns.push(dialect.quote(key)?);
        values.push(binder.bind(encode_value(key, value)?));
    }

    let mut sql = if columns.is_empty() {
        match dialect {
            Dialect::MySql => format!("INSERT INTO {table} () VALUES ()"),
            Dialect::Sqlite | Dialect::Postgres => format!("INSERT INTO {table} DEFAULT VALUES"),
        }
    } else {
        format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        )
    };
    if dialect.supports_returning_id() {
        sql.push_str(" RETURNING \"id\"");
    }
    Ok(binder.finish(sql))
}

/// `UPDATE ... SET`; `None` when the patch has nothing to write.
pub fn update(
    dialect: Dialect,
    table: &str,
    patch: &Record,
    filter: &Filter,
) -> Result<Option<Statement>, NormalizationError> {
    let mut binder = Binder::new(dialect);
    let mut assignments = Vec::with_capacity(patch.len());
    for (key, value) in patch.iter().filter(|(key, _)| key.as_str() != "id") {
        let column = dialect.quote(key)?;
        let value = binder.bind(encode_value(key, value)?);
        assignments.push(format!("{column} = {value}"));
    }
    if assignments.is_empty() {
        return Ok(None);
    }
    let mut sql = format!(
        "UPDATE {} SET {}",
        dialect.quote(table)?,
        assignments.join(", ")
    );
    sql.push_str(&where_clause(&mut binder, filter)?);
    Ok(Some(binder.finish(sql)))
}

pub fn delete(dialect: Dialect, table: &str, filter: &Filter) -> Result<Statement, NormalizationError> {
    let mut binder = Binder::new(dialect);
    let mut sql = format!("DELETE FROM {}", dialect.quote(table)?);
    sql.push_str(&where_clause(&mut binder, filter)?);
    Ok(binder.finish(sql))
}

pub fn count(dialect: Dialect, table: &str, filter: &Filter) -> Result<Statement, NormalizationError> {
    let mut binder = Binder::new(dialect);
    let mut sql = format!("SELECT COUNT(*) AS total FROM {}", dialect.quote(table)?);
    sql.push_str(&where_clause(&mut binder, filter)?);
    Ok(binder.finish(sql))
}

/// `SUM` that yields `0` rather than `NULL` on zero matching rows.
pub fn sum(
    dialect: Dialect,
    table: &str,
    column: &str,
    filter: &Filter,
) -> Result<Statement, NormalizationError> {
    let mut binder = Binder::new(dialect);
    let mut sql = format!(
        "SELECT COALESCE(SUM({}), 0) AS total FROM {}",
        dialect.quote(column)?,
        dialect.quote(table)?
    );
    sql.push_str(&where_clause(&mut binder, filter)?);
    Ok(binder.finish(sql))
}

pub fn create_database(dialect: Dialect, name: &str) -> Result<String, NormalizationError> {
    Ok(format!("CREATE DATABASE {}", dialect.quote(name)?))
}
