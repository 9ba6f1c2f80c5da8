//! Coercion and constraint checks behind `Field::validate`.
//!
//! Every check returns the (possibly transformed) value or a message that
//! the caller wraps into a `ValidationError` for the field.

use super::field::{FieldKind, IpVersion, JsonShape, PasswordPolicy};
use crate::normalize::relational::parse_timestamp;
use crate::value::{Record, Value};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.-]*)://(?P<host>[^/?#\s]+)[^\s]*$")
        .expect("valid url regex")
});

static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?1?\d{9,15}$").expect("valid phone regex"));

const EMAIL_MAX_LEN: usize = 254;
const EMAIL_LOCAL_MAX_LEN: usize = 64;

/// One best-effort conversion of `value` into the shape of `kind`.
pub fn coerce(kind: &FieldKind, value: Value) -> Result<Value, String> {
    match kind {
        FieldKind::String
        | FieldKind::Email
        | FieldKind::Url { .. }
        | FieldKind::Phone
        | FieldKind::Password(_)
        | FieldKind::IpAddress(_)
        | FieldKind::Identifier => coerce_text(value),
        FieldKind::Integer => coerce_integer(value),
        FieldKind::Float { .. } | FieldKind::Decimal { .. } => coerce_float(value),
        FieldKind::Boolean => coerce_bool(value),
        FieldKind::DateTime { .. } => coerce_timestamp(value),
        FieldKind::Json { .. } => coerce_map(value),
        FieldKind::Enum(members) => coerce_member(members, value),
        FieldKind::List(item) => match value {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item_value)| {
                    coerce(item, item_value)
                        .and_then(|coerced| check(item, coerced))
                        .map_err(|message| format!("item {index}: {message}"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            other => Err(expected("list", &other)),
        },
    }
}

/// Kind-specific constraints that do not depend on the field's options.
pub fn check(kind: &FieldKind, value: Value) -> Result<Value, String> {
    match (kind, value) {
        (FieldKind::Email, Value::Text(text)) => check_email(&text).map(|()| Value::Text(text)),
        (FieldKind::Url { schemes }, Value::Text(text)) => {
            check_url(&text, schemes).map(|()| Value::Text(text))
        }
        (FieldKind::Phone, Value::Text(text)) => normalize_phone(&text).map(Value::Text),
        (FieldKind::Password(policy), Value::Text(text)) => {
            check_password(&text, policy).map(|()| Value::Text(text))
        }
        (FieldKind::IpAddress(version), Value::Text(text)) => {
            check_ip(&text, *version).map(|()| Value::Text(text))
        }
        (FieldKind::Float { precision: Some(digits) }, Value::Float(number)) => {
            Ok(Value::Float(round_to(number, *digits)))
        }
        (FieldKind::Decimal { precision, scale }, Value::Float(number)) => {
            check_decimal(number, *precision, *scale).map(|()| Value::Float(number))
        }
        (FieldKind::Json { shape: Some(shape) }, Value::Map(map)) => {
            check_shape(&map, shape, "").map(|()| Value::Map(map))
        }
        (_, value) => Ok(value),
    }
}

fn expected(kind: &str, value: &Value) -> String {
    format!("expected {kind}, got {}", value.kind_name())
}

fn coerce_text(value: Value) -> Result<Value, String> {
    match value {
        Value::Text(_) => Ok(value),
        Value::Int(number) => Ok(Value::Text(number.to_string())),
        Value::Float(number) => Ok(Value::Text(number.to_string())),
        Value::Bool(flag) => Ok(Value::Text(flag.to_string())),
        other => Err(expected("text", &other)),
    }
}

fn coerce_integer(value: Value) -> Result<Value, String> {
    match value {
        Value::Int(_) => Ok(value),
        Value::Float(number) if number.fract() == 0.0 && number.is_finite() => {
            Ok(Value::Int(number as i64))
        }
        Value::Text(text) => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("`{text}` is not an integer")),
        other => Err(expected("integer", &other)),
    }
}

fn coerce_float(value: Value) -> Result<Value, String> {
    match value {
        Value::Float(_) => Ok(value),
        Value::Int(number) => Ok(Value::Float(number as f64)),
        Value::Text(text) => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("`{text}` is not a number")),
        other => Err(expected("float", &other)),
    }
}

fn coerce_bool(value: Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value),
        Value::Int(0) => Ok(Value::Bool(false)),
        Value::Int(1) => Ok(Value::Bool(true)),
        Value::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(format!("`{text}` is not a boolean")),
        },
        other => Err(expected("boolean", &other)),
    }
}

fn coerce_timestamp(value: Value) -> Result<Value, String> {
    match value {
        Value::Timestamp(_) => Ok(value),
        Value::Text(text) => parse_timestamp(&text)
            .or_else(|| {
                DateTime::parse_from_rfc3339(&text)
                    .ok()
                    .map(|at| at.with_timezone(&Utc))
            })
            .map(Value::Timestamp)
            .ok_or_else(|| format!("`{text}` is not a timestamp")),
        other => Err(expected("timestamp", &other)),
    }
}

fn coerce_map(value: Value) -> Result<Value, String> {
    match value {
        Value::Map(_) => Ok(value),
        Value::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json @ serde_json::Value::Object(_)) => Ok(Value::from_json(json)),
            Ok(_) => Err("JSON value must be an object".to_string()),
            Err(err) => Err(format!("invalid JSON: {err}")),
        },
        other => Err(expected("mapping", &other)),
    }
}

fn coerce_member(members: &[String], value: Value) -> Result<Value, String> {
    let text = match value {
        Value::Text(text) => text,
        other => return Err(expected("enum member", &other)),
    };
    if members.iter().any(|member| *member == text) {
        return Ok(Value::Text(text));
    }
    members
        .iter()
        .find(|member| member.eq_ignore_ascii_case(&text))
        .map(|member| Value::Text(member.clone()))
        .ok_or_else(|| format!("invalid enum value `{text}`; must be one of: {}", members.join(", ")))
}

pub fn check_email(text: &str) -> Result<(), String> {
    if !EMAIL_PATTERN.is_match(text) {
        return Err("invalid email format; expected user@domain.tld".to_string());
    }
    if text.len() > EMAIL_MAX_LEN {
        return Err(format!("email is longer than {EMAIL_MAX_LEN} characters"));
    }
    let (local, domain) = text.rsplit_once('@').unwrap_or((text, ""));
    if local.len() > EMAIL_LOCAL_MAX_LEN {
        return Err(format!(
            "local part of email is longer than {EMAIL_LOCAL_MAX_LEN} characters"
        ));
    }
    if domain.starts_with('-') || domain.ends_with('-') {
        return Err("domain cannot start or end with a hyphen".to_string());
    }
    if text.contains("..") {
        return Err("email cannot contain consecutive dots".to_string());
    }
    Ok(())
}

pub fn check_url(text: &str, schemes: &[String]) -> Result<(), String> {
    let captures = URL_PATTERN
        .captures(text)
        .ok_or_else(|| format!("invalid URL `{text}`"))?;
    let scheme = &captures["scheme"];
    if !schemes.is_empty() && !schemes.iter().any(|allowed| allowed.eq_ignore_ascii_case(scheme)) {
        return Err(format!("URL scheme must be one of: {}", schemes.join(", ")));
    }
    Ok(())
}

/// Strips everything but digits, then checks the digit count.
pub fn normalize_phone(text: &str) -> Result<String, String> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if PHONE_PATTERN.is_match(&digits) {
        Ok(digits)
    } else {
        Err("invalid phone number format".to_string())
    }
}

pub fn check_password(text: &str, policy: &PasswordPolicy) -> Result<(), String> {
    if policy.require_upper && !text.chars().any(char::is_uppercase) {
        return Err("password must contain at least one uppercase letter".to_string());
    }
    if policy.require_lower && !text.chars().any(char::is_lowercase) {
        return Err("password must contain at least one lowercase letter".to_string());
    }
    if policy.require_digit && !text.chars().any(|c| c.is_ascii_digit()) {
        return Err("password must contain at least one digit".to_string());
    }
    if policy.require_special && !text.chars().any(|c| !c.is_alphanumeric()) {
        return Err("password must contain at least one special character".to_string());
    }
    Ok(())
}

pub fn check_ip(text: &str, version: IpVersion) -> Result<(), String> {
    let valid = match version {
        IpVersion::V4 => text.parse::<Ipv4Addr>().is_ok(),
        IpVersion::V6 => text.parse::<Ipv6Addr>().is_ok(),
        IpVersion::Any => text.parse::<IpAddr>().is_ok(),
    };
    if valid {
        Ok(())
    } else {
        Err(format!("invalid {} address `{text}`", version.label()))
    }
}

/// `precision` counts every digit, `scale` the fractional ones.
pub fn check_decimal(number: f64, precision: u32, scale: u32) -> Result<(), String> {
    let text = number.abs().to_string();
    let (integer, fraction) = text.split_once('.').unwrap_or((&text, ""));
    if fraction.len() > scale as usize {
        return Err(format!("at most {scale} decimal places allowed"));
    }
    if integer.len() + fraction.len() > precision as usize {
        return Err(format!("at most {precision} digits allowed"));
    }
    Ok(())
}

fn round_to(number: f64, digits: u32) -> f64 {
    let factor = 10_f64.powi(digits as i32);
    (number * factor).round() / factor
}

pub fn check_shape(map: &Record, shape: &JsonShape, path: &str) -> Result<(), String> {
    let JsonShape::Object(keys) = shape else {
        return Ok(());
    };
    for (key, expected_shape) in keys {
        let at = format!("{path}{key}");
        let value = map
            .get(key)
            .ok_or_else(|| format!("missing required key `{at}`"))?;
        let matches = match (expected_shape, value) {
            (JsonShape::Object(_), Value::Map(nested)) => {
                check_shape(nested, expected_shape, &format!("{at}."))?;
                true
            }
            (JsonShape::Text, Value::Text(_))
            | (JsonShape::Integer, Value::Int(_))
            | (JsonShape::Float, Value::Float(_) | Value::Int(_))
            | (JsonShape::Boolean, Value::Bool(_))
            | (JsonShape::List, Value::List(_))
            | (JsonShape::Any, _) => true,
            _ => false,
        };
        if !matches {
            return Err(format!(
                "invalid type for `{at}`: expected {}, got {}",
                expected_shape.label(),
                value.kind_name()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::record;

    #[test]
    fn email_rules_match_common_mistakes() {
        assert!(check_email("john@example.com").is_ok());
        assert!(check_email("john.example.com").is_err());
        assert!(check_email("john..doe@example.com").is_err());
        assert!(check_email("john@-example.com").is_err());
        let long_local = format!("{}@example.com", "a".repeat(65));
        assert!(check_email(&long_local).is_err());
    }

    #[test]
    fn url_scheme_must_be_allowed() {
        let web = vec!["http".to_string(), "https".to_string()];
        assert!(check_url("https://example.com/a?b=1", &web).is_ok());
        assert!(check_url("ftp://example.com", &web).is_err());
        assert!(check_url("example.com", &web).is_err());
    }

    #[test]
    fn phone_numbers_keep_only_digits() {
        assert_eq!(normalize_phone("+1 (555) 010-9999").unwrap(), "15550109999");
        assert!(normalize_phone("12-34").is_err());
    }

    #[test]
    fn password_policy_checks_each_class() {
        let policy = PasswordPolicy::default();
        assert!(check_password("Secr3t!pass", &policy).is_ok());
        assert!(check_password("secr3t!pass", &policy).is_err());
        assert!(check_password("Secret!pass", &policy).is_err());
        assert!(check_password("Secr3tpass", &policy).is_err());
    }

    #[test]
    fn ip_versions_are_distinguished() {
        assert!(check_ip("10.0.0.1", IpVersion::V4).is_ok());
        assert!(check_ip("::1", IpVersion::V4).is_err());
        assert!(check_ip("::1", IpVersion::V6).is_ok());
        assert!(check_ip("not-an-ip", IpVersion::Any).is_err());
    }

    #[test]
    fn decimal_precision_and_scale() {
        assert!(check_decimal(123.45, 5, 2).is_ok());
        assert!(check_decimal(123.456, 6, 2).is_err());
        assert!(check_decimal(12345.6, 5, 2).is_err());
    }

    #[test]
    fn coercion_converts_text_once() {
        assert_eq!(coerce(&FieldKind::Integer, Value::from("42")), Ok(Value::Int(42)));
        assert_eq!(coerce(&FieldKind::Float { precision: None }, Value::Int(3)), Ok(Value::Float(3.0)));
        assert_eq!(coerce(&FieldKind::Boolean, Value::from("yes")), Ok(Value::Bool(true)));
        assert!(coerce(&FieldKind::Integer, Value::from("forty")).is_err());

        let members = vec!["draft".to_string(), "paid".to_string()];
        assert_eq!(
            coerce(&FieldKind::Enum(members.clone()), Value::from("PAID")),
            Ok(Value::from("paid"))
        );
        assert!(coerce(&FieldKind::Enum(members), Value::from("void")).is_err());

        let parsed = coerce(&FieldKind::Json { shape: None }, Value::from(r#"{"a": 1}"#)).unwrap();
        assert_eq!(parsed, Value::Map(record([("a", 1)])));
    }

    #[test]
    fn list_items_are_coerced_and_checked() {
        let kind = FieldKind::List(Box::new(FieldKind::Integer));
        assert_eq!(
            coerce(&kind, Value::from(vec!["1", "2"])),
            Ok(Value::from(vec![1, 2]))
        );
        let err = coerce(&kind, Value::from(vec!["1", "x"])).unwrap_err();
        assert!(err.starts_with("item 1"));
    }

    #[test]
    fn json_shapes_are_checked_recursively() {
        let shape = JsonShape::object([
            ("name", JsonShape::Text),
            ("address", JsonShape::object([("city", JsonShape::Text)])),
        ]);
        let good = record([
            ("name", Value::from("Ann")),
            ("address", Value::Map(record([("city", "Accra")]))),
        ]);
        assert!(check_shape(&good, &shape, "").is_ok());

        let bad = record([
            ("name", Value::from("Ann")),
            ("address", Value::Map(Record::new())),
        ]);
        let err = check_shape(&bad, &shape, "").unwrap_err();
        assert!(err.contains("address.city"));
    }
}
