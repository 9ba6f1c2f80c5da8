//! Entity layer built on the adapter contract.
//!
//! # Responsibility
//! - Describe entity types with explicit schemas (`ModelSchema`).
//! - Validate, persist and reload entities through the active adapter.
//! - Resolve relationships between registered entity types by name.
//!
//! # Invariants
//! - Every operation resolves the adapter through `Dbms` first and fails with
//!   `DbmsError::NotInitialized` before doing any other work.
//! - Lookups return `Option`; a missing record is never an error.
//! - Records read back are re-typed with the schema's declared kinds.
//!
//! # See also
//! - `crate::dbms` for the handle that owns the adapter and the registry.

pub mod entity;
pub mod field;
pub mod hooks;
pub mod relationship;
pub mod schema;
pub mod validators;

pub use entity::{Entity, Related, SaveAction};
pub use field::{ComputeFn, Field, FieldKind, IpVersion, JsonShape, PasswordPolicy, Validator};
pub use hooks::{AsyncHook, Hook, HookPoint, Hooks};
pub use relationship::{RelationKind, Relationship};
pub use schema::{pluralize, ModelSchema};

use crate::dbms::Dbms;
use crate::error::{DbmsError, DbmsResult};
use crate::filter::Filter;
use crate::value::{Record, RecordId};
use chrono::{DateTime, SubsecRound, Utc};
use log::info;
use std::sync::Arc;

/// Current UTC time at the millisecond precision every backend keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Handle of one registered entity type.
#[derive(Debug, Clone)]
pub struct Model {
    dbms: Dbms,
    schema: Arc<ModelSchema>,
}

impl Model {
    pub(crate) fn new(dbms: Dbms, schema: Arc<ModelSchema>) -> Self {
        Self { dbms, schema }
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn table_name(&self) -> &str {
        self.schema.table_name()
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    /// Transient entity; missing fields with a default get that default.
    pub fn build(&self, mut values: Record) -> Entity {
        for field in self.schema.fields() {
            if let Some(default) = field.default() {
                values
                    .entry(field.name().to_string())
                    .or_insert_with(|| default.clone());
            }
        }
        Entity::new(self.dbms.clone(), Arc::clone(&self.schema), values)
    }

    pub fn new_entity(&self) -> Entity {
        self.build(Record::new())
    }

    fn entity(&self, record: Record) -> Entity {
        Entity::new(
            self.dbms.clone(),
            Arc::clone(&self.schema),
            self.schema.decode(record),
        )
    }

    fn eager_relationships(&self) -> Vec<String> {
        self.schema
            .relationships()
            .iter()
            .filter(|relationship| !relationship.is_lazy())
            .map(|relationship| relationship.name().to_string())
            .collect()
    }

    /// Resolves non-lazy relationships one level deep.
    fn hydrate(&self, mut entity: Entity) -> DbmsResult<Entity> {
        for name in self.eager_relationships() {
            entity.related(&name)?;
        }
        Ok(entity)
    }

    async fn hydrate_async(&self, mut entity: Entity) -> DbmsResult<Entity> {
        for name in self.eager_relationships() {
            entity.related_async(&name).await?;
        }
        Ok(entity)
    }

    /// Loads one entity without resolving any relationship.
    pub(crate) fn fetch(&self, id: &RecordId) -> DbmsResult<Option<Entity>> {
        let adapter = self.dbms.adapter()?;
        Ok(adapter
            .find_one(self.table_name(), &Filter::by_id(id), &[])?
            .map(|record| self.entity(record)))
    }

    pub(crate) async fn fetch_async(&self, id: &RecordId) -> DbmsResult<Option<Entity>> {
        let adapter = self.dbms.adapter()?;
        Ok(adapter
            .find_one_async(self.table_name(), &Filter::by_id(id), &[])
            .await?
            .map(|record| self.entity(record)))
    }

    /// Entity with identifier `id`, or `None` when it does not exist.
    pub fn get(&self, id: impl Into<RecordId>) -> DbmsResult<Option<Entity>> {
        match self.fetch(&id.into())? {
            Some(entity) => self.hydrate(entity).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_async(&self, id: impl Into<RecordId>) -> DbmsResult<Option<Entity>> {
        match self.fetch_async(&id.into()).await? {
            Some(entity) => self.hydrate_async(entity).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn find(&self, filter: &Filter) -> DbmsResult<Vec<Entity>> {
        let adapter = self.dbms.adapter()?;
        adapter
            .find(self.table_name(), filter, &[])?
            .into_iter()
            .map(|record| self.hydrate(self.entity(record)))
            .collect()
    }

    pub async fn find_async(&self, filter: &Filter) -> DbmsResult<Vec<Entity>> {
        let adapter = self.dbms.adapter()?;
        let records = adapter.find_async(self.table_name(), filter, &[]).await?;
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            entities.push(self.hydrate_async(self.entity(record)).await?);
        }
        Ok(entities)
    }

    pub fn find_one(&self, filter: &Filter) -> DbmsResult<Option<Entity>> {
        let adapter = self.dbms.adapter()?;
        match adapter.find_one(self.table_name(), filter, &[])? {
            Some(record) => self.hydrate(self.entity(record)).map(Some),
            None => Ok(None),
        }
    }

    pub async fn find_one_async(&self, filter: &Filter) -> DbmsResult<Option<Entity>> {
        let adapter = self.dbms.adapter()?;
        match adapter.find_one_async(self.table_name(), filter, &[]).await? {
            Some(record) => self.hydrate_async(self.entity(record)).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> DbmsResult<Vec<Entity>> {
        self.find(&Filter::new())
    }

    pub async fn all_async(&self) -> DbmsResult<Vec<Entity>> {
        self.find_async(&Filter::new()).await
    }

    pub fn count(&self, filter: &Filter) -> DbmsResult<u64> {
        self.dbms.adapter()?.count(self.table_name(), filter)
    }

    pub async fn count_async(&self, filter: &Filter) -> DbmsResult<u64> {
        let adapter = self.dbms.adapter()?;
        adapter.count_async(self.table_name(), filter).await
    }

    fn check_relationship(&self, name: &str) -> DbmsResult<()> {
        match self.schema.relationship_named(name) {
            Some(_) => Ok(()),
            None => Err(DbmsError::Model(format!(
                "invalid relationship `{name}` on `{}`",
                self.name()
            ))),
        }
    }

    /// Resolved relationship `name` of entity `id`; `None` when the entity
    /// does not exist.
    pub fn get_related(&self, id: impl Into<RecordId>, name: &str) -> DbmsResult<Option<Related>> {
        self.check_relationship(name)?;
        match self.fetch(&id.into())? {
            Some(mut entity) => Ok(Some(entity.related(name)?.clone())),
            None => Ok(None),
        }
    }

    pub async fn get_related_async(
        &self,
        id: impl Into<RecordId>,
        name: &str,
    ) -> DbmsResult<Option<Related>> {
        self.check_relationship(name)?;
        match self.fetch_async(&id.into()).await? {
            Some(mut entity) => Ok(Some(entity.related_async(name).await?.clone())),
            None => Ok(None),
        }
    }

    /// Creates the backing table (relational) when it does not exist.
    pub fn ensure_table(&self) -> DbmsResult<()> {
        self.dbms.adapter()?.ensure_table(&self.schema.table_spec())?;
        info!(
            "event=model_ensure_table module=model status=ok model={} table={}",
            self.name(),
            self.table_name()
        );
        Ok(())
    }

    pub async fn ensure_table_async(&self) -> DbmsResult<()> {
        let adapter = self.dbms.adapter()?;
        adapter.ensure_table_async(&self.schema.table_spec()).await?;
        info!(
            "event=model_ensure_table module=model status=ok model={} table={}",
            self.name(),
            self.table_name()
        );
        Ok(())
    }
}
