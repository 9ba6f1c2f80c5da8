//! Field descriptors and the validation pipeline.
//!
//! # Responsibility
//! - Describe one entity attribute: kind, required flag, default,
//!   uniqueness, index flag, constraints and custom validators.
//! - Validate a supplied value into its stored form.
//!
//! # Invariants
//! - `validate` coerces at most once before checking constraints.
//! - Custom validators run after coercion, in registration order.
//! - Computed fields never validate supplied values.

use super::validators;
use crate::error::ValidationError;
use crate::normalize::TypeHint;
use crate::sql::ddl::{ColumnSpec, ColumnType};
use crate::value::{Record, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Custom validator; returns the (possibly transformed) value.
pub type Validator = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Pure function producing a computed field from the entity's values.
pub type ComputeFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
    Any,
}

impl IpVersion {
    pub fn label(self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
            Self::Any => "IP",
        }
    }
}

/// Character classes a password must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub require_upper: bool,
    pub require_lower: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_special: true,
        }
    }
}

/// Expected structure of a JSON field.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonShape {
    Any,
    Text,
    Integer,
    Float,
    Boolean,
    List,
    /// Keys that must be present, with the shape of their values.
    Object(BTreeMap<String, JsonShape>),
}

impl JsonShape {
    pub fn object<K: Into<String>>(keys: impl IntoIterator<Item = (K, JsonShape)>) -> Self {
        Self::Object(keys.into_iter().map(|(key, shape)| (key.into(), shape)).collect())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::List => "list",
            Self::Object(_) => "object",
        }
    }
}

/// Semantic type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    /// Rounded to `precision` decimal places when set.
    Float { precision: Option<u32> },
    /// Stored as a float; `precision` counts all digits, `scale` the
    /// fractional ones.
    Decimal { precision: u32, scale: u32 },
    Boolean,
    DateTime { auto_now: bool, auto_now_add: bool },
    Json { shape: Option<JsonShape> },
    /// Closed set of text members.
    Enum(Vec<String>),
    List(Box<FieldKind>),
    Email,
    Url { schemes: Vec<String> },
    Phone,
    Password(PasswordPolicy),
    IpAddress(IpVersion),
    Identifier,
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float { .. } => "float",
            Self::Decimal { .. } => "decimal",
            Self::Boolean => "boolean",
            Self::DateTime { .. } => "datetime",
            Self::Json { .. } => "json",
            Self::Enum(_) => "enum",
            Self::List(_) => "list",
            Self::Email => "email",
            Self::Url { .. } => "url",
            Self::Phone => "phone",
            Self::Password(_) => "password",
            Self::IpAddress(_) => "ip_address",
            Self::Identifier => "identifier",
        }
    }

    /// Hint used to re-type values read back from a relational store.
    pub fn type_hint(&self) -> TypeHint {
        match self {
            Self::Integer => TypeHint::Integer,
            Self::Float { .. } | Self::Decimal { .. } => TypeHint::Float,
            Self::Boolean => TypeHint::Boolean,
            Self::DateTime { .. } => TypeHint::Timestamp,
            Self::Json { .. } => TypeHint::Map,
            Self::List(item) => TypeHint::List(Box::new(item.type_hint())),
            Self::Identifier => TypeHint::Identifier,
            _ => TypeHint::Text,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Integer => ColumnType::Integer,
            Self::Float { .. } | Self::Decimal { .. } => ColumnType::Float,
            Self::Boolean => ColumnType::Boolean,
            Self::DateTime { .. } => ColumnType::Timestamp,
            Self::Json { .. } => ColumnType::Json,
            Self::Identifier => ColumnType::Reference,
            _ => ColumnType::Text,
        }
    }
}

/// Descriptor of one entity attribute.
#[derive(Clone)]
pub struct Field {
    name: String,
    kind: FieldKind,
    required: bool,
    default: Option<Value>,
    unique: bool,
    indexed: bool,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min: Option<f64>,
    max: Option<f64>,
    pattern: Option<Regex>,
    validators: Vec<Validator>,
    computed: Option<ComputeFn>,
}

impl Field {
    /// A required field of `kind` without constraints.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            unique: false,
            indexed: false,
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            pattern: None,
            validators: Vec::new(),
            computed: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float { precision: None })
    }

    pub fn decimal(name: impl Into<String>, precision: u32, scale: u32) -> Self {
        Self::new(name, FieldKind::Decimal { precision, scale })
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::DateTime {
                auto_now: false,
                auto_now_add: false,
            },
        )
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Json { shape: None })
    }

    pub fn enumeration<S: Into<String>>(
        name: impl Into<String>,
        members: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::Enum(members.into_iter().map(Into::into).collect()),
        )
    }

    pub fn list(name: impl Into<String>, item: FieldKind) -> Self {
        Self::new(name, FieldKind::List(Box::new(item)))
    }

    pub fn email(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Email)
    }

    /// URL restricted to `http`/`https` unless `schemes` says otherwise.
    pub fn url(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Url {
                schemes: vec!["http".to_string(), "https".to_string()],
            },
        )
    }

    pub fn phone(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Phone)
    }

    /// Password of at least 8 characters containing every character class.
    pub fn password(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Password(PasswordPolicy::default())).min_length(8)
    }

    pub fn ip_address(name: impl Into<String>, version: IpVersion) -> Self {
        Self::new(name, FieldKind::IpAddress(version))
    }

    /// Foreign identifier stored as-is; unique and indexed.
    pub fn identifier(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Identifier).unique().indexed()
    }

    /// Field whose value is always produced by `compute`.
    pub fn computed<F>(name: impl Into<String>, kind: FieldKind, compute: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        let mut field = Self::new(name, kind);
        field.required = false;
        field.computed = Some(Arc::new(compute));
        field
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Minimum text length, or minimum item count for lists.
    pub fn min_length(mut self, length: usize) -> Self {
        self.min_length = Some(length);
        self
    }

    /// Maximum text length, or maximum item count for lists.
    pub fn max_length(mut self, length: usize) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn min(mut self, value: f64) -> Self {
        self.min = Some(value);
        self
    }

    pub fn max(mut self, value: f64) -> Self {
        self.max = Some(value);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Rounding precision of a float field; ignored for other kinds.
    pub fn precision(mut self, digits: u32) -> Self {
        if let FieldKind::Float { precision } = &mut self.kind {
            *precision = Some(digits);
        }
        self
    }

    /// Required-key shape of a JSON field; ignored for other kinds.
    pub fn shape(mut self, expected: JsonShape) -> Self {
        if let FieldKind::Json { shape } = &mut self.kind {
            *shape = Some(expected);
        }
        self
    }

    /// Allowed URL schemes; ignored for other kinds.
    pub fn schemes<S: Into<String>>(mut self, allowed: impl IntoIterator<Item = S>) -> Self {
        if let FieldKind::Url { schemes } = &mut self.kind {
            *schemes = allowed.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn password_policy(mut self, policy: PasswordPolicy) -> Self {
        if let FieldKind::Password(current) = &mut self.kind {
            *current = policy;
        }
        self
    }

    /// Stamps the current time on every save.
    pub fn auto_now(mut self) -> Self {
        if let FieldKind::DateTime { auto_now, .. } = &mut self.kind {
            *auto_now = true;
        }
        self.required = false;
        self
    }

    /// Stamps the current time when no value is present.
    pub fn auto_now_add(mut self) -> Self {
        if let FieldKind::DateTime { auto_now_add, .. } = &mut self.kind {
            *auto_now_add = true;
        }
        self.required = false;
        self
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_computed(&self) -> bool {
        self.computed.is_some()
    }

    pub fn is_password(&self) -> bool {
        matches!(self.kind, FieldKind::Password(_))
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn type_hint(&self) -> TypeHint {
        self.kind.type_hint()
    }

    pub fn column(&self) -> ColumnSpec {
        let mut column = ColumnSpec::new(self.name.clone(), self.kind.column_type());
        if self.unique {
            column = column.unique();
        }
        if self.indexed {
            column = column.indexed();
        }
        column
    }

    /// Runs the computed function against `values`, if any.
    pub fn compute(&self, values: &Record) -> Option<Value> {
        self.computed.as_ref().map(|compute| compute(values))
    }

    fn error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::new(self.name.clone(), message)
    }

    /// Validates `value` into its stored form.
    pub fn validate(&self, value: Value) -> Result<Value, ValidationError> {
        if self.computed.is_some() {
            return Ok(value);
        }
        let value = match (&self.kind, value) {
            (FieldKind::DateTime { auto_now: true, .. }, _) => return Ok(super::now().into()),
            (FieldKind::DateTime { auto_now_add: true, .. }, Value::Null) => {
                return Ok(super::now().into())
            }
            (_, Value::Null) => self.default.clone().unwrap_or(Value::Null),
            (_, value) => value,
        };
        if value.is_null() {
            return if self.required {
                Err(self.error("field is required"))
            } else {
                Ok(Value::Null)
            };
        }

        let value = validators::coerce(&self.kind, value).map_err(|message| self.error(message))?;
        let value = validators::check(&self.kind, value).map_err(|message| self.error(message))?;
        self.check_bounds(&value)?;

        self.validators.iter().try_fold(value, |value, validator| {
            validator(value).map_err(|message| self.error(message))
        })
    }

    fn check_bounds(&self, value: &Value) -> Result<(), ValidationError> {
        let length = match value {
            Value::Text(text) => Some(text.chars().count()),
            Value::List(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length {
            let unit = if matches!(value, Value::List(_)) {
                "items"
            } else {
                "characters"
            };
            if let Some(min) = self.min_length.filter(|min| length < *min) {
                return Err(self.error(format!("must have at least {min} {unit}")));
            }
            if let Some(max) = self.max_length.filter(|max| length > *max) {
                return Err(self.error(format!("must have at most {max} {unit}")));
            }
        }

        if let Some(number) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| number < *min) {
                return Err(self.error(format!("value must be at least {min}")));
            }
            if let Some(max) = self.max.filter(|max| number > *max) {
                return Err(self.error(format!("value must be at most {max}")));
            }
        }

        if let (Some(pattern), Value::Text(text)) = (&self.pattern, value) {
            if !pattern.is_match(text) {
                return Err(self.error(format!("does not match pattern `{}`", pattern.as_str())));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("unique", &self.unique)
            .field("indexed", &self.indexed)
            .field("validators", &self.validators.len())
            .field("computed", &self.computed.is_some())
            .finish()
    }
}
