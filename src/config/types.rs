//! Raw config types for one entity table and its relations (camelCase JSON).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the id column is filled when a create payload omits it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Caller supplies the id or the database default fills it.
    #[default]
    None,
    /// Generate a v4 UUID in process.
    Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnConfig {
    pub name: String,
    /// PostgreSQL type used for parameter casts (e.g. "timestamptz", "uuid", "integer").
    #[serde(default)]
    pub pg_type: Option<String>,
    /// Whether the column has a DB default; inserts omit it when the payload does.
    #[serde(default)]
    pub has_default: bool,
}

impl ColumnConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ColumnConfig {
            name: name.into(),
            pg_type: None,
            has_default: false,
        }
    }

    pub fn typed(name: impl Into<String>, pg_type: impl Into<String>) -> Self {
        ColumnConfig {
            name: name.into(),
            pg_type: Some(pg_type.into()),
            has_default: false,
        }
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }
}

fn default_id() -> String {
    "id".into()
}

/// Foreign key expanded into a nested object on read.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BelongsTo {
    /// Output property holding the nested object.
    pub field: String,
    /// Column on this table holding the target id.
    pub foreign_key: String,
    pub target_table: String,
    #[serde(default = "default_id")]
    pub target_key: String,
    #[serde(default)]
    pub target_schema: Option<String>,
    /// Foreign keys of the target expanded inside the nested object.
    #[serde(default)]
    pub nested: Vec<BelongsTo>,
}

/// Many-to-many association through a junction table, carried as an id array.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BelongsToMany {
    /// Payload / output property holding the target ids (e.g. "tagIds").
    pub field: String,
    pub junction_table: String,
    /// Junction column referencing this table's id.
    pub source_column: String,
    /// Junction column referencing the target id.
    pub target_column: String,
    #[serde(default)]
    pub junction_schema: Option<String>,
    /// PostgreSQL type of the target ids; defaults to this table's id type.
    #[serde(default)]
    pub target_type: Option<String>,
}

/// Many-to-many association hydrated into target row objects.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BelongsToManyObject {
    pub field: String,
    pub junction_table: String,
    pub source_column: String,
    pub target_column: String,
    pub target_table: String,
    #[serde(default = "default_id")]
    pub target_key: String,
    #[serde(default)]
    pub junction_schema: Option<String>,
    #[serde(default)]
    pub target_schema: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
}

/// Association count reported under `_count.<field>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Countable {
    pub field: String,
    /// Table holding the referencing rows (a junction or a child table).
    pub table: String,
    /// Column on `table` referencing this table's id.
    pub foreign_key: String,
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RelationConfig {
    BelongsTo(BelongsTo),
    BelongsToMany(BelongsToMany),
    BelongsToManyObject(BelongsToManyObject),
    Countable(Countable),
}

impl RelationConfig {
    pub fn field(&self) -> &str {
        match self {
            RelationConfig::BelongsTo(r) => &r.field,
            RelationConfig::BelongsToMany(r) => &r.field,
            RelationConfig::BelongsToManyObject(r) => &r.field,
            RelationConfig::Countable(r) => &r.field,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

/// Declarative description of one entity table. Everything the service needs is here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableConfig {
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    #[serde(default = "default_id")]
    pub id_column: String,
    #[serde(default)]
    pub id_strategy: IdStrategy,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(default)]
    pub sort_column: Option<String>,
    /// Domain columns. The id and configured timestamp/sort columns are added when missing.
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub search_fields: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
    #[serde(default)]
    pub validation: HashMap<String, ValidationRule>,
}

impl TableConfig {
    pub fn new(table: impl Into<String>) -> Self {
        TableConfig {
            schema: None,
            table: table.into(),
            id_column: default_id(),
            id_strategy: IdStrategy::None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            sort_column: None,
            columns: Vec::new(),
            search_fields: Vec::new(),
            relations: Vec::new(),
            validation: HashMap::new(),
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn uuid_ids(mut self) -> Self {
        self.id_strategy = IdStrategy::Uuid;
        self
    }

    /// Use `created_at` / `updated_at` timestamp columns.
    pub fn timestamps(mut self) -> Self {
        self.created_at = Some("created_at".into());
        self.updated_at = Some("updated_at".into());
        self
    }

    pub fn soft_delete(mut self, column: impl Into<String>) -> Self {
        self.deleted_at = Some(column.into());
        self
    }

    pub fn sortable(mut self, column: impl Into<String>) -> Self {
        self.sort_column = Some(column.into());
        self
    }

    pub fn column(mut self, column: ColumnConfig) -> Self {
        self.columns.push(column);
        self
    }

    pub fn search(mut self, fields: &[&str]) -> Self {
        self.search_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn relation(mut self, relation: RelationConfig) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, crate::error::ConfigError> {
        serde_json::from_value(value).map_err(|e| crate::error::ConfigError::Invalid(e.to_string()))
    }
}
