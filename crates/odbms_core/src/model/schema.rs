//! Static description of one entity type.
//!
//! # Responsibility
//! - Hold the ordered field and relationship descriptors of an entity type.
//! - Derive the storage table name and the relational table layout.
//! - Re-type records read back from a store using the declared kinds.
//!
//! # Invariants
//! - `id`, `created_at` and `updated_at` are implicit and never declared.
//! - Field and relationship names are unique within a schema; declaring a
//!   name again replaces the earlier descriptor.

use super::entity::Entity;
use super::field::Field;
use super::hooks::{HookPoint, Hooks};
use super::relationship::Relationship;
use crate::error::DbmsResult;
use crate::normalize::relational::apply_hint;
use crate::normalize::TypeHint;
use crate::sql::ddl::TableSpec;
use crate::value::Record;
use futures::future::BoxFuture;
use std::sync::Arc;

const IMPLICIT_KEYS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Debug, Clone)]
pub struct ModelSchema {
    name: String,
    table: String,
    fields: Vec<Field>,
    relationships: Vec<Relationship>,
    hooks: Hooks,
}

impl ModelSchema {
    /// Schema named `name`, stored in the pluralised lowercase table.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let table = pluralize(&name.to_lowercase());
        Self {
            name,
            table,
            fields: Vec::new(),
            relationships: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    /// Overrides the derived table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.retain(|existing| existing.name() != field.name());
        self.fields.push(field);
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships
            .retain(|existing| existing.name() != relationship.name());
        self.relationships.push(relationship);
        self
    }

    pub fn before_save<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Entity) -> DbmsResult<()> + Send + Sync + 'static,
    {
        self.hook(HookPoint::BeforeSave, hook)
    }

    pub fn after_save<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Entity) -> DbmsResult<()> + Send + Sync + 'static,
    {
        self.hook(HookPoint::AfterSave, hook)
    }

    pub fn before_delete<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Entity) -> DbmsResult<()> + Send + Sync + 'static,
    {
        self.hook(HookPoint::BeforeDelete, hook)
    }

    pub fn after_delete<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Entity) -> DbmsResult<()> + Send + Sync + 'static,
    {
        self.hook(HookPoint::AfterDelete, hook)
    }

    pub fn hook<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: Fn(&mut Entity) -> DbmsResult<()> + Send + Sync + 'static,
    {
        self.hooks.add(point, Arc::new(hook));
        self
    }

    pub fn before_save_async<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Entity) -> BoxFuture<'a, DbmsResult<()>> + Send + Sync + 'static,
    {
        self.hook_async(HookPoint::BeforeSave, hook)
    }

    pub fn after_save_async<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Entity) -> BoxFuture<'a, DbmsResult<()>> + Send + Sync + 'static,
    {
        self.hook_async(HookPoint::AfterSave, hook)
    }

    pub fn before_delete_async<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Entity) -> BoxFuture<'a, DbmsResult<()>> + Send + Sync + 'static,
    {
        self.hook_async(HookPoint::BeforeDelete, hook)
    }

    pub fn after_delete_async<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Entity) -> BoxFuture<'a, DbmsResult<()>> + Send + Sync + 'static,
    {
        self.hook_async(HookPoint::AfterDelete, hook)
    }

    pub fn hook_async<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Entity) -> BoxFuture<'a, DbmsResult<()>> + Send + Sync + 'static,
    {
        self.hooks.add_async(point, Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_named(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name() == name)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn relationship_named(&self, name: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|relationship| relationship.name() == name)
    }

    /// Relationship whose identifier column is `column`.
    pub fn relationship_for_column(&self, column: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|relationship| relationship.column() == column)
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Relational layout: declared fields, then relationship columns.
    pub fn table_spec(&self) -> TableSpec {
        let fields = self
            .fields
            .iter()
            .filter(|field| !IMPLICIT_KEYS.contains(&field.name()))
            .map(Field::column);
        let relationships = self.relationships.iter().map(Relationship::column_spec);
        fields
            .chain(relationships)
            .fold(TableSpec::new(self.table.clone()), TableSpec::column)
    }

    /// Declared type of `key`, falling back to the key-name conventions.
    pub fn hint(&self, key: &str) -> Option<TypeHint> {
        if let Some(field) = self.field_named(key) {
            return Some(field.type_hint());
        }
        if let Some(relationship) = self.relationship_for_column(key) {
            return Some(relationship.type_hint());
        }
        TypeHint::builtin(key)
    }

    /// Re-types every value of `record` according to its hint.
    pub fn decode(&self, record: Record) -> Record {
        record
            .into_iter()
            .map(|(key, value)| {
                let value = match self.hint(&key) {
                    Some(hint) => apply_hint(value, &hint),
                    None => value,
                };
                (key, value)
            })
            .collect()
    }
}

/// English plural of a lowercase model name.
pub fn pluralize(word: &str) -> String {
    const IRREGULAR: [(&str, &str); 6] = [
        ("person", "people"),
        ("child", "children"),
        ("man", "men"),
        ("woman", "women"),
        ("mouse", "mice"),
        ("datum", "data"),
    ];
    if let Some((_, plural)) = IRREGULAR.iter().find(|(single, _)| *single == word) {
        return (*plural).to_string();
    }

    let consonant_before = |suffix_len: usize| {
        word[..word.len() - suffix_len]
            .chars()
            .last()
            .is_some_and(|c| !"aeiou".contains(c))
    };
    if word.ends_with('y') && consonant_before(1) {
        return format!("{}ies", &word[..word.len() - 1]);
    }
    if ["s", "x", "z", "ch", "sh"]
        .iter()
        .any(|suffix| word.ends_with(suffix))
    {
        return format!("{word}es");
    }
    if word.ends_with("fe") {
        return format!("{}ves", &word[..word.len() - 2]);
    }
    if word.ends_with('f') && !word.ends_with("ff") {
        return format!("{}ves", &word[..word.len() - 1]);
    }
    format!("{word}s")
}
