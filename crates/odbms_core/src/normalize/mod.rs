//! Record and filter normalization between canonical and native shapes.
//!
//! # Responsibility
//! - `relational`: canonical values <-> SQL scalars.
//! - `document`: canonical records/filters <-> BSON documents.
//! - Type hints shared by both directions.
//!
//! # Invariants
//! - Normalization is pure: no I/O, no global state.
//! - Identifier keys are `id`, `*_id` (single) and `*_ids` (list).

pub mod document;
pub mod relational;

/// Declared type used to re-type values read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeHint {
    Any,
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Map,
    Identifier,
    List(Box<TypeHint>),
}

impl TypeHint {
    /// Hint implied by the key name alone.
    pub fn builtin(key: &str) -> Option<Self> {
        if is_identifier_key(key) {
            return Some(Self::Identifier);
        }
        if is_identifier_list_key(key) {
            return Some(Self::List(Box::new(Self::Identifier)));
        }
        match key {
            "created_at" | "updated_at" => Some(Self::Timestamp),
            _ => None,
        }
    }
}

pub fn is_identifier_key(key: &str) -> bool {
    key == "id" || key.ends_with("_id")
}

pub fn is_identifier_list_key(key: &str) -> bool {
    key.ends_with("_ids")
}
