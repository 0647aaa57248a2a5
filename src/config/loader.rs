//! Resolve a TableConfig into the runtime model.

use crate::config::resolved::{ColumnInfo, JunctionRelation, JunctionTarget, ResolvedTable};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;

/// Default schema for tables and relation targets that do not name one. From env `ENGINE_SCHEMA`, default `public`.
pub fn default_schema() -> String {
    std::env::var("ENGINE_SCHEMA").unwrap_or_else(|_| "public".into())
}

/// Build the resolved table from config (validates first).
pub fn resolve(config: &TableConfig) -> Result<ResolvedTable, ConfigError> {
    let default_sid = config.schema.clone().unwrap_or_else(default_schema);

    let mut columns: Vec<ColumnInfo> = config
        .columns
        .iter()
        .map(|c| ColumnInfo {
            name: c.name.clone(),
            has_default: c.has_default,
            pg_type: c.pg_type.clone(),
        })
        .collect();

    // Managed columns are implied by the config; add the ones not declared explicitly.
    let implied: [(Option<&String>, bool, Option<&str>); 5] = [
        (Some(&config.id_column), config.id_strategy == IdStrategy::None, None),
        (config.created_at.as_ref(), true, Some("timestamptz")),
        (config.updated_at.as_ref(), true, Some("timestamptz")),
        (config.deleted_at.as_ref(), false, Some("timestamptz")),
        (config.sort_column.as_ref(), false, None),
    ];
    for (name, has_default, pg_type) in implied {
        let Some(name) = name else { continue };
        if !columns.iter().any(|c| &c.name == name) {
            columns.push(ColumnInfo {
                name: name.clone(),
                has_default,
                pg_type: pg_type.map(str::to_string),
            });
        }
    }

    let id_type = columns
        .iter()
        .find(|c| c.name == config.id_column)
        .and_then(|c| c.pg_type.clone());

    let mut belongs_to = Vec::new();
    let mut junctions = Vec::new();
    let mut countables = Vec::new();
    for rel in &config.relations {
        match rel {
            RelationConfig::BelongsTo(b) => belongs_to.push(b.clone()),
            RelationConfig::BelongsToMany(m) => junctions.push(JunctionRelation {
                field: m.field.clone(),
                schema_name: m.junction_schema.clone().unwrap_or_else(|| default_sid.clone()),
                junction_table: m.junction_table.clone(),
                source_column: m.source_column.clone(),
                target_column: m.target_column.clone(),
                target_type: m.target_type.clone().or_else(|| id_type.clone()),
                target: None,
            }),
            RelationConfig::BelongsToManyObject(m) => junctions.push(JunctionRelation {
                field: m.field.clone(),
                schema_name: m.junction_schema.clone().unwrap_or_else(|| default_sid.clone()),
                junction_table: m.junction_table.clone(),
                source_column: m.source_column.clone(),
                target_column: m.target_column.clone(),
                target_type: m.target_type.clone().or_else(|| id_type.clone()),
                target: Some(JunctionTarget {
                    schema_name: m.target_schema.clone().unwrap_or_else(|| default_sid.clone()),
                    table_name: m.target_table.clone(),
                    key_column: m.target_key.clone(),
                }),
            }),
            RelationConfig::Countable(c) => countables.push(c.clone()),
        }
    }

    let table = ResolvedTable {
        schema_name: default_sid.clone(),
        table_name: config.table.clone(),
        id_column: config.id_column.clone(),
        id_strategy: config.id_strategy,
        created_at: config.created_at.clone(),
        updated_at: config.updated_at.clone(),
        deleted_at: config.deleted_at.clone(),
        sort_column: config.sort_column.clone(),
        columns,
        search_fields: config.search_fields.clone(),
        belongs_to,
        junctions,
        countables,
        validation: config.validation.clone(),
        default_schema: default_sid,
    };
    validate(&table)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> TableConfig {
        TableConfig::new("products")
            .schema("shop")
            .uuid_ids()
            .timestamps()
            .soft_delete("deleted_at")
            .sortable("sort_order")
            .column(ColumnConfig::new("name"))
            .relation(RelationConfig::BelongsToMany(BelongsToMany {
                field: "tagIds".into(),
                junction_table: "product_tags".into(),
                source_column: "product_id".into(),
                target_column: "tag_id".into(),
                junction_schema: None,
                target_type: None,
            }))
    }

    #[test]
    fn implied_columns_are_added() {
        let t = resolve(&products()).unwrap();
        for c in ["id", "name", "created_at", "updated_at", "deleted_at", "sort_order"] {
            assert!(t.has_column(c), "missing {}", c);
        }
        assert_eq!(t.column("created_at").unwrap().pg_type.as_deref(), Some("timestamptz"));
        assert!(t.column("created_at").unwrap().has_default);
        // uuid ids are generated in process, so the id column has no DB default
        assert!(!t.id_info().unwrap().has_default);
    }

    #[test]
    fn junction_schema_defaults_to_table_schema() {
        let t = resolve(&products()).unwrap();
        let j = t.junction("tagIds").unwrap();
        assert_eq!(j.schema_name, "shop");
        assert!(j.target.is_none());
        assert!(t.is_relation_field("tagIds"));
        assert!(t.is_relation_field("_count"));
        assert!(!t.is_relation_field("name"));
    }

    #[test]
    fn managed_columns_cover_timestamps_and_sort() {
        let t = resolve(&products()).unwrap();
        let managed = t.managed_columns();
        assert_eq!(managed, vec!["id", "created_at", "updated_at", "deleted_at", "sort_order"]);
    }
}
