//! Resolved table model: config validated and flattened for runtime use.

use crate::config::{BelongsTo, Countable, IdStrategy, ValidationRule};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct ColumnInfo {
    pub name: String,
    /// Whether the column has a DB default (e.g. gen_random_uuid(), NOW()).
    pub has_default: bool,
    /// PostgreSQL type name for SQL casts (e.g. "timestamptz") when binding values.
    pub pg_type: Option<String>,
}

/// Target side of a junction relation that hydrates into row objects.
#[derive(Clone, Debug)]
pub struct JunctionTarget {
    pub schema_name: String,
    pub table_name: String,
    pub key_column: String,
}

/// belongsToMany and belongsToManyObject share one shape; `target` is set for the object variant.
#[derive(Clone, Debug)]
pub struct JunctionRelation {
    pub field: String,
    pub schema_name: String,
    pub junction_table: String,
    pub source_column: String,
    pub target_column: String,
    /// Cast applied to target id parameters.
    pub target_type: Option<String>,
    pub target: Option<JunctionTarget>,
}

#[derive(Clone, Debug)]
pub struct ResolvedTable {
    pub schema_name: String,
    pub table_name: String,
    pub id_column: String,
    pub id_strategy: IdStrategy,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub deleted_at: Option<String>,
    pub sort_column: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub search_fields: Vec<String>,
    pub belongs_to: Vec<BelongsTo>,
    pub junctions: Vec<JunctionRelation>,
    pub countables: Vec<Countable>,
    pub validation: HashMap<String, ValidationRule>,
    /// Schema used for relation targets that do not name one.
    pub default_schema: String,
}

impl ResolvedTable {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn id_info(&self) -> Option<&ColumnInfo> {
        self.column(&self.id_column)
    }

    pub fn junction(&self, field: &str) -> Option<&JunctionRelation> {
        self.junctions.iter().find(|j| j.field == field)
    }

    /// Payload keys that belong to relations rather than columns.
    pub fn is_relation_field(&self, key: &str) -> bool {
        key == "_count"
            || self.junctions.iter().any(|j| j.field == key)
            || self.belongs_to.iter().any(|b| b.field == key)
    }

    /// Columns `duplicate` must not copy.
    pub fn managed_columns(&self) -> Vec<&str> {
        let mut out = vec![self.id_column.as_str()];
        for c in [&self.created_at, &self.updated_at, &self.deleted_at, &self.sort_column]
            .into_iter()
            .flatten()
        {
            out.push(c.as_str());
        }
        out
    }
}
