//! Table creation following the relational schema convention.
//!
//! Every table gets an engine-native auto-increment `id`, plus `created_at`
//! and `updated_at` text timestamps in the sortable storage format. Both
//! default to the current UTC time; `updated_at` is refreshed by a trigger.

use super::Dialect;
use crate::error::NormalizationError;

/// Storage class of a declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
    /// Foreign key of one related row; lists of keys are `Text`.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub indexed: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
            indexed: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
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
}

/// Columns of one entity table, excluding `id`/`created_at`/`updated_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }
}

fn now_expression(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "(strftime('%Y-%m-%d %H:%M:%f', 'now') || '000')",
        Dialect::MySql => "(DATE_FORMAT(UTC_TIMESTAMP(6), '%Y-%m-%d %H:%i:%s.%f'))",
        Dialect::Postgres => {
            "(to_char(clock_timestamp() AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS.US'))"
        }
    }
}

fn column_type(dialect: Dialect, column: &ColumnSpec) -> &'static str {
    let keyed = column.unique || column.indexed;
    match (dialect, column.column_type) {
        (Dialect::Sqlite, ColumnType::Integer | ColumnType::Boolean | ColumnType::Reference) => {
            "INTEGER"
        }
        (Dialect::Sqlite, ColumnType::Float) => "REAL",
        (Dialect::Sqlite, _) => "TEXT",

        (Dialect::MySql, ColumnType::Integer | ColumnType::Reference) => "BIGINT",
        (Dialect::MySql, ColumnType::Float) => "DOUBLE",
        (Dialect::MySql, ColumnType::Boolean) => "BOOLEAN",
        (Dialect::MySql, ColumnType::Timestamp) => "VARCHAR(32)",
        (Dialect::MySql, ColumnType::Text) if keyed => "VARCHAR(255)",
        (Dialect::MySql, _) => "TEXT",

        (Dialect::Postgres, ColumnType::Integer | ColumnType::Reference) => "BIGINT",
        (Dialect::Postgres, ColumnType::Float) => "DOUBLE PRECISION",
        (Dialect::Postgres, ColumnType::Boolean) => "BOOLEAN",
        (Dialect::Postgres, _) => "TEXT",
    }
}

/// Statements creating the table, its indexes and its touch trigger.
///
/// Every statement is idempotent, so running the list again is harmless.
pub fn create_table(dialect: Dialect, spec: &TableSpec) -> Result<Vec<String>, NormalizationError> {
    let table = dialect.quote(&spec.name)?;
    let now = now_expression(dialect);
    let (id_column, stamp_type) = match dialect {
        Dialect::Sqlite => ("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT", "TEXT"),
        Dialect::MySql => ("`id` BIGINT AUTO_INCREMENT PRIMARY KEY", "VARCHAR(32)"),
        Dialect::Postgres => ("\"id\" BIGSERIAL PRIMARY KEY", "TEXT"),
    };

    let mut definitions = vec![id_column.to_string()];
    for column in &spec.columns {
        if matches!(column.name.as_str(), "id" | "created_at" | "updated_at") {
            continue;
        }
        let mut definition = format!(
            "{} {}",
            dialect.quote(&column.name)?,
            column_type(dialect, column)
        );
        if !column.nullable {
            definition.push_str(" NOT NULL");
        }
        if column.unique {
            definition.push_str(" UNIQUE");
        }
        definitions.push(definition);
    }
    for stamp in ["created_at", "updated_at"] {
        definitions.push(format!(
            "{} {stamp_type} NOT NULL DEFAULT {now}",
            dialect.quote(stamp)?
        ));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        definitions.join(", ")
    )];

    let mut indexes = Vec::new();
    for column in spec.columns.iter().filter(|c| c.indexed && !c.unique) {
        let index = dialect.quote(&format!("idx_{}_{}", spec.name, column.name))?;
        let target = dialect.quote(&column.name)?;
        indexes.push((index, target));
    }
    match dialect {
        // MySQL has no CREATE INDEX IF NOT EXISTS; indexes are declared inline.
        Dialect::MySql if !indexes.is_empty() => {
            let inline: Vec<String> = indexes
                .iter()
                .map(|(index, target)| format!("INDEX {index} ({target})"))
                .collect();
            let create = &mut statements[0];
            create.pop();
            create.push_str(&format!(", {})", inline.join(", ")));
        }
        Dialect::MySql => {}
        Dialect::Sqlite | Dialect::Postgres => {
            for (index, target) in indexes {
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {index} ON {table} ({target})"
                ));
            }
        }
    }

    let trigger = dialect.quote(&format!("{}_touch_updated_at", spec.name))?;
    match dialect {
        Dialect::Sqlite => statements.push(format!(
            "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER UPDATE ON {table} FOR EACH ROW \
             WHEN NEW.\"updated_at\" = OLD.\"updated_at\" \
             BEGIN UPDATE {table} SET \"updated_at\" = {now} WHERE \"id\" = NEW.\"id\"; END"
        )),
        Dialect::MySql => statements.push(format!(
            "CREATE TRIGGER IF NOT EXISTS {trigger} BEFORE UPDATE ON {table} FOR EACH ROW \
             SET NEW.`updated_at` = IF(NEW.`updated_at` = OLD.`updated_at`, {now}, NEW.`updated_at`)"
        )),
        Dialect::Postgres => {
            statements.push(format!(
                "CREATE OR REPLACE FUNCTION odbms_touch_updated_at() RETURNS TRIGGER AS $$ \
                 BEGIN IF NEW.\"updated_at\" = OLD.\"updated_at\" THEN NEW.\"updated_at\" := {now}; END IF; \
                 RETURN NEW; END; $$ LANGUAGE plpgsql"
            ));
            statements.push(format!(
                "CREATE OR REPLACE TRIGGER {trigger} BEFORE UPDATE ON {table} FOR EACH ROW \
                 EXECUTE FUNCTION odbms_touch_updated_at()"
            ));
        }
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSpec {
        TableSpec::new("users")
            .column(ColumnSpec::new("email", ColumnType::Text).not_null().unique())
            .column(ColumnSpec::new("age", ColumnType::Integer).indexed())
            .column(ColumnSpec::new("owner_id", ColumnType::Reference))
            .column(ColumnSpec::new("tag_ids", ColumnType::Text))
    }

    #[test]
    fn sqlite_table_has_bookkeeping_columns_index_and_trigger() {
        let statements = create_table(Dialect::Sqlite, &users()).unwrap();
        assert_eq!(statements.len(), 3);
        let create = &statements[0];
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS \"users\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(create.contains("\"email\" TEXT NOT NULL UNIQUE"));
        assert!(create.contains("\"owner_id\" INTEGER, \"tag_ids\" TEXT"));
        assert!(create.contains("\"created_at\" TEXT NOT NULL DEFAULT"));
        assert!(create.contains("\"updated_at\" TEXT NOT NULL DEFAULT"));
        assert_eq!(
            statements[1],
            "CREATE INDEX IF NOT EXISTS \"idx_users_age\" ON \"users\" (\"age\")"
        );
        assert!(statements[2].starts_with("CREATE TRIGGER IF NOT EXISTS \"users_touch_updated_at\""));
    }

    #[test]
    fn mysql_declares_indexes_inline_and_sizes_keyed_text() {
        let statements = create_table(Dialect::MySql, &users()).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("`email` VARCHAR(255) NOT NULL UNIQUE"));
        assert!(statements[0].ends_with(", INDEX `idx_users_age` (`age`))"));
    }

    #[test]
    fn postgres_uses_function_backed_trigger() {
        let statements = create_table(Dialect::Postgres, &users()).unwrap();
        assert!(statements[0].contains("\"id\" BIGSERIAL PRIMARY KEY"));
        assert!(statements
            .iter()
            .any(|sql| sql.contains("EXECUTE FUNCTION odbms_touch_updated_at()")));
    }

    #[test]
    fn rejects_invalid_table_names() {
        assert!(create_table(Dialect::Sqlite, &TableSpec::new("bad name")).is_err());
    }
}
