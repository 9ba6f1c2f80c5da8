//! Relationship descriptors between registered entity types.
//!
//! A relationship stores foreign identifiers only. To-one relationships keep
//! one identifier in `<name>_id`; to-many relationships keep an ordered list
//! in `<name>_ids`. Related entities are cached on the owning entity, never
//! embedded in the stored record.
//!
//! `backref` and `through` are descriptive metadata for callers and schema
//! tooling. Resolution, cascade and DDL read only the identifier column.

use crate::normalize::TypeHint;
use crate::sql::ddl::{ColumnSpec, ColumnType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    /// `true` for the variants that store an ordered list of identifiers.
    pub fn is_many(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::ManyToOne => "many_to_one",
            Self::ManyToMany => "many_to_many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    name: String,
    kind: RelationKind,
    target: String,
    lazy: bool,
    cascade: bool,
    backref: Option<String>,
    through: Option<String>,
}

impl Relationship {
    /// Lazy, non-cascading relationship to the model registered as `target`.
    pub fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            lazy: true,
            cascade: false,
            backref: None,
            through: None,
        }
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::OneToOne, target)
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::OneToMany, target)
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::ManyToOne, target)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::ManyToMany, target)
    }

    /// Resolves the relationship whenever the owner is loaded.
    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }

    /// Deletes related entities when the owner is deleted with cascade.
    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    /// Name of the inverse relationship on the target model.
    ///
    /// Descriptive only: the inverse side is not maintained on save.
    pub fn backref(mut self, name: impl Into<String>) -> Self {
        self.backref = Some(name.into());
        self
    }

    /// Association table name for many-to-many relationships.
    ///
    /// Descriptive only: identifiers stay in the owner's `<name>_ids`
    /// column and no association table is created or read.
    pub fn through(mut self, table: impl Into<String>) -> Self {
        self.through = Some(table.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn is_cascade(&self) -> bool {
        self.cascade
    }

    pub fn backref_name(&self) -> Option<&str> {
        self.backref.as_deref()
    }

    pub fn through_table(&self) -> Option<&str> {
        self.through.as_deref()
    }

    pub fn is_many(&self) -> bool {
        self.kind.is_many()
    }

    /// Record key holding the stored identifier(s).
    pub fn column(&self) -> String {
        if self.is_many() {
            format!("{}_ids", self.name)
        } else {
            format!("{}_id", self.name)
        }
    }

    pub fn column_spec(&self) -> ColumnSpec {
        let column_type = if self.is_many() {
            ColumnType::Text
        } else {
            ColumnType::Reference
        };
        let column = ColumnSpec::new(self.column(), column_type);
        if self.is_many() {
            column
        } else {
            column.indexed()
        }
    }

    pub fn type_hint(&self) -> TypeHint {
        if self.is_many() {
            TypeHint::List(Box::new(TypeHint::Identifier))
        } else {
            TypeHint::Identifier
        }
    }
}
