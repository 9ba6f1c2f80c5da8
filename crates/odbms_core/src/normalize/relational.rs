//! Canonical <-> relational value encoding.
//!
//! # Responsibility
//! - Encode canonical values into bindable SQL scalars.
//! - Decode driver scalars back into canonical values, using key-based
//!   built-in hints and caller-supplied type hints.
//!
//! # Invariants
//! - Encoding is total for representable values and deterministic.
//! - `decode(encode(v), hint_of(v)) == v` for scalars, lists, mappings,
//!   timestamps and identifiers (timestamps at microsecond precision).
//! - A list element never contains `LIST_SEPARATOR`.

use super::{is_identifier_key, is_identifier_list_key, TypeHint};
use crate::error::NormalizationError;
use crate::value::{Record, Value};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Separator for list values stored in a single text column.
pub const LIST_SEPARATOR: &str = "::";

/// Lexicographically sortable UTC timestamp text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Scalar bound to (or read from) a relational statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Row as returned by a driver: column name and scalar, in select order.
pub type NativeRow = Vec<(String, SqlParam)>;

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses the stored text format, RFC 3339, or a bare
/// `YYYY-MM-DD HH:MM:SS[.f]` (read as UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

fn integer_text(text: &str) -> Option<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Integer whose decimal form is exactly `text`; `"007"`, `"+7"` and `"-0"`
/// stay text so they read back unchanged.
fn identifier_integer(text: &str) -> Option<i64> {
    integer_text(text).filter(|number| number.to_string() == text)
}

fn encode_identifier(text: &str) -> SqlParam {
    identifier_integer(text)
        .map(SqlParam::Int)
        .unwrap_or_else(|| SqlParam::Text(text.to_string()))
}

/// Encodes one canonical value stored under `key`.
///
/// Identifier keys (`id`, `*_id`) holding the decimal form of an integer
/// become integers so they compare against auto-increment columns.
pub fn encode_value(key: &str, value: &Value) -> Result<SqlParam, NormalizationError> {
    match value {
        Value::Text(text) if is_identifier_key(key) => Ok(encode_identifier(text)),
        Value::List(items) => encode_list(key, items).map(SqlParam::Text),
        Value::Map(map) => serde_json::to_string(&crate::value::record_to_json(map))
            .map(SqlParam::Text)
            .map_err(|err| NormalizationError::Unrepresentable {
                key: key.to_string(),
                reason: err.to_string(),
            }),
        scalar => encode_scalar(key, scalar),
    }
}

/// Encodes a set-operator element, applying the identifier rule of `key`
/// but never joining lists.
pub fn encode_element(key: &str, value: &Value) -> Result<SqlParam, NormalizationError> {
    match value {
        Value::Text(text) if is_identifier_key(key) || is_identifier_list_key(key) => {
            Ok(encode_identifier(text))
        }
        Value::List(_) | Value::Map(_) => Err(NormalizationError::Unrepresentable {
            key: key.to_string(),
            reason: format!("set operand element must be a scalar, got {}", value.kind_name()),
        }),
        scalar => encode_scalar(key, scalar),
    }
}

fn encode_scalar(key: &str, value: &Value) -> Result<SqlParam, NormalizationError> {
    Ok(match value {
        Value::Null => SqlParam::Null,
        Value::Bool(flag) => SqlParam::Bool(*flag),
        Value::Int(number) => SqlParam::Int(*number),
        Value::Float(number) => SqlParam::Float(*number),
        Value::Text(text) => SqlParam::Text(text.clone()),
        Value::Timestamp(at) => SqlParam::Text(format_timestamp(at)),
        Value::List(_) | Value::Map(_) => {
            return Err(NormalizationError::Unrepresentable {
                key: key.to_string(),
                reason: format!("{} is not a scalar", value.kind_name()),
            })
        }
    })
}

fn encode_list(key: &str, items: &[Value]) -> Result<String, NormalizationError> {
    if let [Value::Text(only)] = items {
        if only.is_empty() {
            return Err(NormalizationError::Unrepresentable {
                key: key.to_string(),
                reason: "a list holding one empty string is indistinguishable from an empty list"
                    .to_string(),
            });
        }
    }

    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let text = match item {
            Value::Text(text) => text.clone(),
            Value::Int(number) => number.to_string(),
            Value::Float(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Timestamp(at) => format_timestamp(at),
            other => {
                return Err(NormalizationError::Unrepresentable {
                    key: key.to_string(),
                    reason: format!("list elements must be scalars, got {}", other.kind_name()),
                })
            }
        };
        if text.contains(LIST_SEPARATOR) {
            return Err(NormalizationError::ReservedSeparator {
                key: key.to_string(),
                element: text,
            });
        }
        parts.push(text);
    }
    Ok(parts.join(LIST_SEPARATOR))
}

/// Encodes every field of `record`, in key order.
pub fn encode_record(record: &Record) -> Result<Vec<(String, SqlParam)>, NormalizationError> {
    record
        .iter()
        .map(|(key, value)| encode_value(key, value).map(|param| (key.clone(), param)))
        .collect()
}

/// Decodes a driver scalar with the built-in hint for `key`.
pub fn decode_param(key: &str, param: SqlParam) -> Value {
    let value = match param {
        SqlParam::Null => Value::Null,
        SqlParam::Bool(flag) => Value::Bool(flag),
        SqlParam::Int(number) => Value::Int(number),
        SqlParam::Float(number) => Value::Float(number),
        SqlParam::Text(text) => Value::Text(text),
    };
    match TypeHint::builtin(key) {
        Some(hint) => apply_hint(value, &hint),
        None => value,
    }
}

/// Decodes a driver row into a canonical record.
pub fn decode_row(row: NativeRow) -> Record {
    row.into_iter()
        .map(|(key, param)| {
            let value = decode_param(&key, param);
            (key, value)
        })
        .collect()
}

/// Re-types a canonical value according to `hint`.
///
/// Values that cannot be converted are returned unchanged; validation on
/// the model side reports them.
pub fn apply_hint(value: Value, hint: &TypeHint) -> Value {
    match (hint, value) {
        (_, Value::Null) => Value::Null,
        (TypeHint::Any, value) => value,
        (TypeHint::Text, Value::Int(number)) => Value::Text(number.to_string()),
        (TypeHint::Text, Value::Float(number)) => Value::Text(number.to_string()),
        (TypeHint::Identifier, Value::Int(number)) => Value::Text(number.to_string()),
        (TypeHint::Integer, Value::Text(text)) => match integer_text(&text) {
            Some(number) => Value::Int(number),
            None => Value::Text(text),
        },
        (TypeHint::Integer, Value::Bool(flag)) => Value::Int(i64::from(flag)),
        (TypeHint::Integer, Value::Float(number)) if number.fract() == 0.0 => {
            Value::Int(number as i64)
        }
        (TypeHint::Float, Value::Int(number)) => Value::Float(number as f64),
        (TypeHint::Float, Value::Text(text)) => match text.trim().parse::<f64>() {
            Ok(number) => Value::Float(number),
            Err(_) => Value::Text(text),
        },
        (TypeHint::Boolean, Value::Int(number)) => Value::Bool(number != 0),
        (TypeHint::Boolean, Value::Text(text)) => match text.trim().to_ascii_lowercase().as_str()
        {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::Text(text),
        },
        (TypeHint::Timestamp, Value::Text(text)) => match parse_timestamp(&text) {
            Some(at) => Value::Timestamp(at),
            None => Value::Text(text),
        },
        (TypeHint::Map, Value::Text(text)) => match serde_json::from_str(&text) {
            Ok(json) => Value::from_json(json),
            Err(_) => Value::Text(text),
        },
        (TypeHint::List(inner), Value::Text(text)) => {
            if text.is_empty() {
                return Value::List(Vec::new());
            }
            Value::List(
                text.split(LIST_SEPARATOR)
                    .map(|part| apply_hint(Value::Text(part.to_string()), inner))
                    .collect(),
            )
        }
        (TypeHint::List(inner), Value::List(items)) => Value::List(
            items
                .into_iter()
                .map(|item| apply_hint(item, inner))
                .collect(),
        ),
        (_, value) => value,
    }
}
