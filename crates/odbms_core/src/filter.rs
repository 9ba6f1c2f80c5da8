//! Canonical query filters.
//!
//! # Responsibility
//! - Represent "field equals value" and MongoDB-style operator terms.
//! - Parse operator sub-mappings (`{"age": {"$gt": 18}}`) from records.
//!
//! # Invariants
//! - Operator sub-mappings are exactly one level deep; the type cannot
//!   express nesting.
//! - `$in`/`$nin` operands are always lists.

use crate::error::NormalizationError;
use crate::value::{Record, RecordId, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Comparison operator usable inside an operator sub-mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Ne,
    In,
    Nin,
}

impl Operator {
    /// MongoDB spelling of the operator.
    pub fn token(self) -> &'static str {
        match self {
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Ne => "$ne",
            Self::In => "$in",
            Self::Nin => "$nin",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$ne" => Some(Self::Ne),
            "$in" => Some(Self::In),
            "$nin" => Some(Self::Nin),
            _ => None,
        }
    }

    pub fn is_set_operator(self) -> bool {
        matches!(self, Self::In | Self::Nin)
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Right-hand side of one filter key.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    /// Conjunction of operator terms on the same field.
    Ops(Vec<(Operator, Value)>),
}

/// Conjunction of per-field conditions; empty matches every record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    terms: BTreeMap<String, Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on the canonical `id` key.
    pub fn by_id(id: &RecordId) -> Self {
        Self::new().eq("id", id.to_value())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.insert(field.into(), Condition::Eq(value.into()));
        self
    }

    /// Adds an operator term; repeated calls on one field are ANDed.
    ///
    /// An equality previously set on the same field is replaced.
    pub fn op(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.terms.entry(field.into()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => match entry.get_mut() {
                Condition::Ops(ops) => ops.push((op, value)),
                eq => *eq = Condition::Ops(vec![(op, value)]),
            },
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Condition::Ops(vec![(op, value)]));
            }
        }
        self
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Lt, value)
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Lte, value)
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Gt, value)
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Gte, value)
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Ne, value)
    }

    pub fn is_in<V: Into<Value>>(self, field: impl Into<String>, values: Vec<V>) -> Self {
        self.op(field, Operator::In, Value::from(values))
    }

    pub fn not_in<V: Into<Value>>(self, field: impl Into<String>, values: Vec<V>) -> Self {
        self.op(field, Operator::Nin, Value::from(values))
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn get(&self, field: &str) -> Option<&Condition> {
        self.terms.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Condition)> {
        self.terms.iter()
    }

    /// Parses a MongoDB-style mapping.
    ///
    /// A mapping value whose keys all start with `$` is an operator
    /// sub-mapping; any other value (including plain mappings) is equality.
    pub fn from_record(record: &Record) -> Result<Self, NormalizationError> {
        let mut filter = Self::new();
        for (field, value) in record {
            if field.starts_with('$') {
                return Err(NormalizationError::InvalidFilter(format!(
                    "top-level operator `{field}` is not supported"
                )));
            }
            match value {
                Value::Map(map) if !map.is_empty() && map.keys().all(|key| key.starts_with('$')) => {
                    let mut ops = Vec::with_capacity(map.len());
                    for (token, operand) in map {
                        let op = Operator::parse(token).ok_or_else(|| {
                            NormalizationError::InvalidFilter(format!(
                                "unknown operator `{token}` on `{field}`"
                            ))
                        })?;
                        ops.push((op, operand.clone()));
                    }
                    filter.terms.insert(field.clone(), Condition::Ops(ops));
                }
                other => {
                    filter.terms.insert(field.clone(), Condition::Eq(other.clone()));
                }
            }
        }
        filter.check()?;
        Ok(filter)
    }

    /// Verifies operand shapes: set operators need lists and no operand may
    /// itself be an operator mapping.
    pub fn check(&self) -> Result<(), NormalizationError> {
        for (field, condition) in &self.terms {
            let Condition::Ops(ops) = condition else {
                continue;
            };
            if ops.is_empty() {
                return Err(NormalizationError::InvalidFilter(format!(
                    "empty operator mapping on `{field}`"
                )));
            }
            for (op, operand) in ops {
                if op.is_set_operator() && !matches!(operand, Value::List(_)) {
                    return Err(NormalizationError::InvalidFilter(format!(
                        "`{op}` on `{field}` requires a list operand, got {}",
                        operand.kind_name()
                    )));
                }
                if let Value::Map(map) = operand {
                    if map.keys().any(|key| key.starts_with('$')) {
                        return Err(NormalizationError::InvalidFilter(format!(
                            "nested operator mapping under `{op}` on `{field}`"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Filter {
    type Item = (&'a String, &'a Condition);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.terms.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::record;

    #[test]
    fn from_record_splits_equality_and_operators() {
        let ops = record([("$gte", Value::from(18)), ("$lt", Value::from(65))]);
        let input = record([
            ("age", Value::Map(ops)),
            ("email", Value::from("a@b.co")),
        ]);
        let filter = Filter::from_record(&input).unwrap();

        assert_eq!(
            filter.get("email"),
            Some(&Condition::Eq(Value::from("a@b.co")))
        );
        match filter.get("age") {
            Some(Condition::Ops(ops)) => {
                assert_eq!(ops.len(), 2);
                assert!(ops.contains(&(Operator::Gte, Value::Int(18))));
                assert!(ops.contains(&(Operator::Lt, Value::Int(65))));
            }
            other => panic!("unexpected condition: {other:?}"),
        }
    }

    #[test]
    fn plain_mapping_is_equality() {
        let input = record([("meta", Value::Map(record([("k", Value::from(1))])))]);
        let filter = Filter::from_record(&input).unwrap();
        assert!(matches!(filter.get("meta"), Some(Condition::Eq(Value::Map(_)))));
    }

    #[test]
    fn rejects_unknown_and_nested_operators() {
        let unknown = record([("age", Value::Map(record([("$regex", Value::from("x"))])))]);
        assert!(Filter::from_record(&unknown).is_err());

        let nested_inner = record([("$gt", Value::from(1))]);
        let nested = record([(
            "age",
            Value::Map(record([("$ne", Value::Map(nested_inner))])),
        )]);
        assert!(Filter::from_record(&nested).is_err());
    }

    #[test]
    fn set_operators_require_lists() {
        let filter = Filter::new().op("id", Operator::In, 3);
        assert!(filter.check().is_err());
        assert!(Filter::new().is_in("id", vec![1, 2]).check().is_ok());
    }

    #[test]
    fn repeated_ops_on_one_field_accumulate() {
        let filter = Filter::new().gt("age", 1).lt("age", 9);
        assert!(matches!(filter.get("age"), Some(Condition::Ops(ops)) if ops.len() == 2));
        assert_eq!(filter.len(), 1);
    }
}
