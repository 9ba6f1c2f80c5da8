//! Entity instances and their persistence lifecycle.
//!
//! # Responsibility
//! - Hold the canonical values of one entity plus its relationship cache.
//! - Run the save/delete lifecycle through the active adapter.
//! - Resolve relationships lazily through the registered target model.
//!
//! # Invariants
//! - Every storage call resolves the adapter first, so an uninitialized
//!   handle fails before any hook or validation runs.
//! - Relationship columns hold identifiers only; resolved entities live in
//!   the process-local cache and are never written to storage.
//! - `updated_at` is stamped on every successful prepare; `created_at` only
//!   when absent.
//!
//! # See also
//! - `super::Model` for lookups that produce entities.

use super::hooks::HookPoint;
use super::schema::ModelSchema;
use crate::dbms::Dbms;
use crate::error::{DbmsError, DbmsResult};
use crate::filter::Filter;
use crate::value::{Record, RecordId, Value};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::debug;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Resolved value of one relationship.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<Entity>),
    Many(Vec<Entity>),
}

impl Related {
    pub fn one(&self) -> Option<&Entity> {
        match self {
            Self::One(entity) => entity.as_ref(),
            Self::Many(_) => None,
        }
    }

    pub fn many(&self) -> &[Entity] {
        match self {
            Self::One(_) => &[],
            Self::Many(entities) => entities,
        }
    }

    fn to_json(&self) -> JsonValue {
        match self {
            Self::One(Some(entity)) => entity.to_json(),
            Self::One(None) => JsonValue::Null,
            Self::Many(entities) => JsonValue::Array(entities.iter().map(Entity::to_json).collect()),
        }
    }
}

/// Outcome of a save, for callers that care which statement ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    Inserted,
    Updated,
}

/// Set of `(table, id)` pairs already deleted by one cascade.
type Visited = HashSet<(String, String)>;

#[derive(Clone)]
pub struct Entity {
    dbms: Dbms,
    schema: Arc<ModelSchema>,
    values: Record,
    related: HashMap<String, Related>,
}

impl Entity {
    pub(crate) fn new(dbms: Dbms, schema: Arc<ModelSchema>, values: Record) -> Self {
        Self {
            dbms,
            schema,
            values,
            related: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    pub fn model_name(&self) -> &str {
        self.schema.name()
    }

    /// Identifier, absent while the entity is transient.
    pub fn id(&self) -> Option<RecordId> {
        self.values.get("id").and_then(RecordId::from_value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|value| !value.is_null())
    }

    /// Sets a value; writing a relationship column drops its cached entities.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        if let Some(relationship) = self.schema.relationship_for_column(&key) {
            self.related.remove(relationship.name());
        }
        self.values.insert(key, value.into());
        self
    }

    pub fn values(&self) -> &Record {
        &self.values
    }

    pub fn into_values(self) -> Record {
        self.values
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.values.get("created_at").and_then(Value::as_timestamp)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.values.get("updated_at").and_then(Value::as_timestamp)
    }

    /// Validates every declared field in place.
    ///
    /// Stops at the first failing field; nothing is written to storage.
    pub fn validate(&mut self) -> DbmsResult<()> {
        let schema = Arc::clone(&self.schema);
        for field in schema.fields().iter().filter(|field| !field.is_computed()) {
            let current = self.values.remove(field.name()).unwrap_or_default();
            let validated = field.validate(current)?;
            self.values.insert(field.name().to_string(), validated);
        }
        Ok(())
    }

    /// Recomputes every computed field from the current values.
    pub fn compute(&mut self) {
        let schema = Arc::clone(&self.schema);
        for field in schema.fields() {
            if let Some(value) = field.compute(&self.values) {
                self.values.insert(field.name().to_string(), value);
            }
        }
    }

    /// Validates, computes, stamps timestamps and returns the record to store.
    fn prepare(&mut self) -> DbmsResult<Record> {
        self.validate()?;
        self.compute();

        let now = Value::Timestamp(super::now());
        self.values.insert("updated_at".to_string(), now.clone());
        if self.values.get("created_at").map_or(true, Value::is_null) {
            self.values.insert("created_at".to_string(), now);
        }
        for relationship in self.schema.relationships() {
            let empty = if relationship.is_many() {
                Value::List(Vec::new())
            } else {
                Value::Null
            };
            self.values.entry(relationship.column()).or_insert(empty);
        }
        Ok(self.values.clone())
    }

    fn adopt_id(&mut self, id: RecordId) {
        self.values.insert("id".to_string(), id.to_value());
    }

    /// Inserts a transient entity or updates a persisted one.
    ///
    /// Blocking; use [`Entity::save_async`] inside async tasks.
    pub fn save(&mut self) -> DbmsResult<SaveAction> {
        let adapter = self.dbms.adapter()?;
        let schema = Arc::clone(&self.schema);
        let table = schema.table_name();

        schema.hooks().run(HookPoint::BeforeSave, self)?;
        let mut record = self.prepare()?;

        let existing = match self.id() {
            Some(id) => adapter
                .find_one(table, &Filter::by_id(&id), &[])?
                .map(|_| id),
            None => None,
        };
        let action = match existing {
            Some(id) => {
                record.remove("id");
                adapter.update(table, &Filter::by_id(&id), &record)?;
                SaveAction::Updated
            }
            None => {
                let id = adapter.insert(table, &record)?;
                self.adopt_id(id);
                SaveAction::Inserted
            }
        };

        schema.hooks().run(HookPoint::AfterSave, self)?;
        self.log_saved(action);
        Ok(action)
    }

    pub async fn save_async(&mut self) -> DbmsResult<SaveAction> {
        let adapter = self.dbms.adapter()?;
        let worker = self.dbms.worker();
        let schema = Arc::clone(&self.schema);
        let table = schema.table_name();

        schema
            .hooks()
            .run_async(HookPoint::BeforeSave, self, &worker)
            .await?;
        let mut record = self.prepare()?;

        let existing = match self.id() {
            Some(id) => adapter
                .find_one_async(table, &Filter::by_id(&id), &[])
                .await?
                .map(|_| id),
            None => None,
        };
        let action = match existing {
            Some(id) => {
                record.remove("id");
                adapter
                    .update_async(table, &Filter::by_id(&id), &record)
                    .await?;
                SaveAction::Updated
            }
            None => {
                let id = adapter.insert_async(table, &record).await?;
                self.adopt_id(id);
                SaveAction::Inserted
            }
        };

        schema
            .hooks()
            .run_async(HookPoint::AfterSave, self, &worker)
            .await?;
        self.log_saved(action);
        Ok(action)
    }

    fn log_saved(&self, action: SaveAction) {
        debug!(
            "event=entity_save module=model status=ok model={} table={} action={}",
            self.schema.name(),
            self.schema.table_name(),
            match action {
                SaveAction::Inserted => "insert",
                SaveAction::Updated => "update",
            }
        );
    }

    fn require_id(&self, operation: &str) -> DbmsResult<RecordId> {
        self.id().ok_or_else(|| {
            DbmsError::Model(format!(
                "cannot {operation} unsaved `{}` entity",
                self.schema.name()
            ))
        })
    }

    /// Removes the entity; with `cascade`, cascadable relationships are
    /// deleted first, depth-first, each entity at most once.
    ///
    /// Returns the number of records removed for this entity.
    pub fn delete(&mut self, cascade: bool) -> DbmsResult<u64> {
        let mut visited = Visited::new();
        self.delete_visiting(cascade, &mut visited)
    }

    fn delete_visiting(&mut self, cascade: bool, visited: &mut Visited) -> DbmsResult<u64> {
        let adapter = self.dbms.adapter()?;
        let schema = Arc::clone(&self.schema);
        let id = self.require_id("delete")?;
        visited.insert((schema.table_name().to_string(), id.to_string()));

        schema.hooks().run(HookPoint::BeforeDelete, self)?;
        if cascade {
            for relationship in schema.relationships().iter().filter(|r| r.is_cascade()) {
                let related = self.related(relationship.name())?.clone();
                for mut child in related_entities(related) {
                    if !child.is_visited(visited) {
                        child.delete_visiting(true, visited)?;
                    }
                }
            }
        }
        let removed = adapter.remove(schema.table_name(), &Filter::by_id(&id))?;
        schema.hooks().run(HookPoint::AfterDelete, self)?;

        debug!(
            "event=entity_delete module=model status=ok model={} table={} cascade={} removed={}",
            schema.name(),
            schema.table_name(),
            cascade,
            removed
        );
        Ok(removed)
    }

    pub async fn delete_async(&mut self, cascade: bool) -> DbmsResult<u64> {
        let mut visited = Visited::new();
        self.delete_visiting_async(cascade, &mut visited).await
    }

    fn delete_visiting_async<'a>(
        &'a mut self,
        cascade: bool,
        visited: &'a mut Visited,
    ) -> BoxFuture<'a, DbmsResult<u64>> {
        Box::pin(async move {
            let adapter = self.dbms.adapter()?;
            let worker = self.dbms.worker();
            let schema = Arc::clone(&self.schema);
            let id = self.require_id("delete")?;
            visited.insert((schema.table_name().to_string(), id.to_string()));

            schema
                .hooks()
                .run_async(HookPoint::BeforeDelete, self, &worker)
                .await?;
            if cascade {
                for relationship in schema.relationships().iter().filter(|r| r.is_cascade()) {
                    let related = self.related_async(relationship.name()).await?.clone();
                    for mut child in related_entities(related) {
                        if !child.is_visited(visited) {
                            child.delete_visiting_async(true, visited).await?;
                        }
                    }
                }
            }
            let removed = adapter
                .remove_async(schema.table_name(), &Filter::by_id(&id))
                .await?;
            schema
                .hooks()
                .run_async(HookPoint::AfterDelete, self, &worker)
                .await?;

            debug!(
                "event=entity_delete module=model status=ok model={} table={} cascade={} removed={}",
                schema.name(),
                schema.table_name(),
                cascade,
                removed
            );
            Ok(removed)
        })
    }

    fn is_visited(&self, visited: &Visited) -> bool {
        self.id().is_some_and(|id| {
            visited.contains(&(self.schema.table_name().to_string(), id.to_string()))
        })
    }

    /// Identifiers stored for relationship `name`, in stored order.
    pub fn related_ids(&self, name: &str) -> DbmsResult<Vec<RecordId>> {
        let relationship = self.relationship(name)?;
        Ok(match self.values.get(&relationship.column()) {
            Some(Value::List(items)) => items.iter().filter_map(RecordId::from_value).collect(),
            Some(value) => RecordId::from_value(value).into_iter().collect(),
            None => Vec::new(),
        })
    }

    fn relationship(&self, name: &str) -> DbmsResult<&super::relationship::Relationship> {
        self.schema.relationship_named(name).ok_or_else(|| {
            DbmsError::Model(format!(
                "`{}` has no relationship `{name}`",
                self.schema.name()
            ))
        })
    }

    /// Resolves relationship `name`, caching the result.
    ///
    /// Identifiers whose target no longer exists are skipped.
    pub fn related(&mut self, name: &str) -> DbmsResult<&Related> {
        if !self.related.contains_key(name) {
            let relationship = self.relationship(name)?.clone();
            let target = self.dbms.model(relationship.target())?;
            let mut found = Vec::new();
            for id in self.related_ids(name)? {
                if let Some(entity) = target.fetch(&id)? {
                    found.push(entity);
                }
            }
            self.cache(name, relationship.is_many(), found);
        }
        self.cached(name)
    }

    pub async fn related_async(&mut self, name: &str) -> DbmsResult<&Related> {
        if !self.related.contains_key(name) {
            let relationship = self.relationship(name)?.clone();
            let target = self.dbms.model(relationship.target())?;
            let mut found = Vec::new();
            for id in self.related_ids(name)? {
                if let Some(entity) = target.fetch_async(&id).await? {
                    found.push(entity);
                }
            }
            self.cache(name, relationship.is_many(), found);
        }
        self.cached(name)
    }

    pub fn related_one(&mut self, name: &str) -> DbmsResult<Option<Entity>> {
        Ok(self.related(name)?.one().cloned())
    }

    pub fn related_many(&mut self, name: &str) -> DbmsResult<Vec<Entity>> {
        Ok(self.related(name)?.many().to_vec())
    }

    pub async fn related_one_async(&mut self, name: &str) -> DbmsResult<Option<Entity>> {
        Ok(self.related_async(name).await?.one().cloned())
    }

    pub async fn related_many_async(&mut self, name: &str) -> DbmsResult<Vec<Entity>> {
        Ok(self.related_async(name).await?.many().to_vec())
    }

    fn cache(&mut self, name: &str, many: bool, found: Vec<Entity>) {
        let related = if many {
            Related::Many(found)
        } else {
            Related::One(found.into_iter().next())
        };
        self.related.insert(name.to_string(), related);
    }

    fn cached(&self, name: &str) -> DbmsResult<&Related> {
        self.related.get(name).ok_or_else(|| {
            DbmsError::Model(format!("relationship `{name}` was not resolved"))
        })
    }

    /// `true` when relationship `name` is already resolved.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.related.contains_key(name)
    }

    /// Assigns the ordered entities of a to-many relationship.
    ///
    /// Every entity must already be saved and belong to the target model.
    pub fn set_related_many(&mut self, name: &str, entities: &[Entity]) -> DbmsResult<()> {
        let relationship = self.relationship(name)?.clone();
        if !relationship.is_many() {
            return Err(DbmsError::Model(format!(
                "relationship `{name}` is {}; assign a single entity",
                relationship.kind().name()
            )));
        }
        let ids = entities
            .iter()
            .map(|entity| self.check_target(&relationship, entity))
            .collect::<DbmsResult<Vec<_>>>()?;
        self.values.insert(
            relationship.column(),
            Value::List(ids.iter().map(RecordId::to_value).collect()),
        );
        self.related
            .insert(name.to_string(), Related::Many(entities.to_vec()));
        Ok(())
    }

    /// Assigns a to-one relationship; `None` clears the stored identifier.
    pub fn set_related_one(&mut self, name: &str, entity: Option<&Entity>) -> DbmsResult<()> {
        let relationship = self.relationship(name)?.clone();
        if relationship.is_many() {
            return Err(DbmsError::Model(format!(
                "relationship `{name}` is {}; assign a list of entities",
                relationship.kind().name()
            )));
        }
        let stored = match entity {
            Some(entity) => self.check_target(&relationship, entity)?.to_value(),
            None => Value::Null,
        };
        self.values.insert(relationship.column(), stored);
        self.related
            .insert(name.to_string(), Related::One(entity.cloned()));
        Ok(())
    }

    fn check_target(
        &self,
        relationship: &super::relationship::Relationship,
        entity: &Entity,
    ) -> DbmsResult<RecordId> {
        if entity.model_name() != relationship.target() {
            return Err(DbmsError::Model(format!(
                "relationship `{}` expects `{}`, got `{}`",
                relationship.name(),
                relationship.target(),
                entity.model_name()
            )));
        }
        entity.id().ok_or_else(|| {
            DbmsError::Model(format!(
                "related `{}` entity must be saved before assignment to `{}`",
                entity.model_name(),
                relationship.name()
            ))
        })
    }

    /// JSON export; password fields are left out and resolved
    /// relationships are embedded under their names.
    pub fn to_json(&self) -> JsonValue {
        let mut object: JsonMap<String, JsonValue> = self
            .values
            .iter()
            .filter(|(key, _)| {
                self.schema
                    .field_named(key)
                    .map_or(true, |field| !field.is_password())
            })
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        for relationship in self.schema.relationships() {
            if let Some(related) = self.related.get(relationship.name()) {
                object.insert(relationship.name().to_string(), related.to_json());
            }
        }
        JsonValue::Object(object)
    }
}

fn related_entities(related: Related) -> Vec<Entity> {
    match related {
        Related::One(entity) => entity.into_iter().collect(),
        Related::Many(entities) => entities,
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("model", &self.schema.name())
            .field("values", &self.values)
            .field("loaded", &self.related.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, Relationship};
    use crate::value::record;

    fn detached(schema: ModelSchema, values: Record) -> Entity {
        Entity::new(Dbms::new(), Arc::new(schema), values)
    }

    #[test]
    fn save_fails_fast_before_hooks_when_not_initialized() {
        let schema = ModelSchema::new("User")
            .field(Field::string("name"))
            .before_save(|_| Err(DbmsError::Hook("must not run".to_string())));
        let mut user = detached(schema, Record::new());
        assert!(matches!(user.save(), Err(DbmsError::NotInitialized)));
    }

    #[test]
    fn prepare_stamps_timestamps_and_relationship_columns() {
        let schema = ModelSchema::new("Post")
            .field(Field::string("title"))
            .relationship(Relationship::many_to_one("author", "User"))
            .relationship(Relationship::many_to_many("tags", "Tag"));
        let mut post = detached(schema, record([("title", "hello")]));
        let stored = post.prepare().unwrap();
        assert!(post.created_at().is_some());
        assert_eq!(post.created_at(), post.updated_at());
        assert_eq!(stored["author_id"], Value::Null);
        assert_eq!(stored["tags_ids"], Value::List(Vec::new()));
    }

    #[test]
    fn validation_errors_name_the_field() {
        let schema = ModelSchema::new("User").field(Field::email("email"));
        let mut user = detached(schema, record([("email", "nope")]));
        match user.validate() {
            Err(DbmsError::Validation(err)) => assert_eq!(err.field, "email"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn assignments_require_saved_entities_of_the_target_model() {
        let tag_schema = Arc::new(ModelSchema::new("Tag"));
        let post_schema = ModelSchema::new("Post").relationship(Relationship::many_to_many("tags", "Tag"));
        let mut post = detached(post_schema, Record::new());

        let unsaved = Entity::new(Dbms::new(), Arc::clone(&tag_schema), Record::new());
        assert!(matches!(
            post.set_related_many("tags", &[unsaved]),
            Err(DbmsError::Model(_))
        ));

        let saved = Entity::new(Dbms::new(), tag_schema, record([("id", "4")]));
        post.set_related_many("tags", &[saved]).unwrap();
        assert_eq!(post.related_ids("tags").unwrap(), vec![RecordId::from("4")]);
        assert!(post.is_loaded("tags"));
        assert!(matches!(
            post.set_related_one("tags", None),
            Err(DbmsError::Model(_))
        ));

        post.set("tags_ids", Value::List(Vec::new()));
        assert!(!post.is_loaded("tags"));
    }

    #[test]
    fn to_json_hides_passwords_and_embeds_loaded_relationships() {
        let user_schema = Arc::new(
            ModelSchema::new("User")
                .field(Field::string("name"))
                .field(Field::password("password")),
        );
        let author = Entity::new(
            Dbms::new(),
            Arc::clone(&user_schema),
            record([("id", "1"), ("name", "Ada"), ("password", "S3cret!pw")]),
        );
        assert!(author.to_json().get("password").is_none());

        let post_schema =
            ModelSchema::new("Post").relationship(Relationship::many_to_one("author", "User"));
        let mut post = detached(post_schema, record([("id", "9")]));
        post.set_related_one("author", Some(&author)).unwrap();
        let json = post.to_json();
        assert_eq!(json["author_id"], JsonValue::from("1"));
        assert_eq!(json["author"]["name"], JsonValue::from("Ada"));
        assert!(json["author"].get("password").is_none());
    }
}
