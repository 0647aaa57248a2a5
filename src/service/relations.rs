//! Many-to-many relation writes: split relation fields off a payload, then replace junction rows.

use crate::config::{JunctionRelation, ResolvedTable};
use crate::error::EngineError;
use crate::service::params::Record;
use crate::service::rows;
use crate::sql::{delete_junction_rows, insert_junction_rows};
use serde_json::Value;
use sqlx::PgConnection;
use std::collections::HashSet;

/// Target ids to associate for one junction field (deduplicated, input order kept).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RelationWrite {
    pub field: String,
    pub targets: Vec<Value>,
}

fn target_id(j: &JunctionRelation, item: &Value) -> Result<Value, EngineError> {
    let invalid = || EngineError::validation(&j.field, format!("{} must contain ids", j.field));
    match item {
        Value::String(_) | Value::Number(_) => Ok(item.clone()),
        Value::Object(obj) => {
            let key = j.target.as_ref().map(|t| t.key_column.as_str()).ok_or_else(invalid)?;
            match obj.get(key) {
                Some(v @ (Value::String(_) | Value::Number(_))) => Ok(v.clone()),
                _ => Err(EngineError::validation(&j.field, format!("{} objects must carry '{}'", j.field, key))),
            }
        }
        _ => Err(invalid()),
    }
}

/// Remove relation fields from the payload. Junction fields become writes; hydrated read-only
/// fields (belongsTo objects, `_count`) are discarded.
pub(crate) fn split(table: &ResolvedTable, record: &mut Record) -> Result<Vec<RelationWrite>, EngineError> {
    let mut writes = Vec::new();
    for j in &table.junctions {
        let Some(value) = record.remove(&j.field) else { continue };
        let Value::Array(items) = value else {
            return Err(EngineError::validation(&j.field, format!("{} must be an array", j.field)));
        };
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(items.len());
        for item in &items {
            let id = target_id(j, item)?;
            if seen.insert(id.to_string()) {
                targets.push(id);
            }
        }
        writes.push(RelationWrite {
            field: j.field.clone(),
            targets,
        });
    }
    record.retain(|k, _| !table.is_relation_field(k));
    Ok(writes)
}

/// Drop every relation field without writing it. Returns the junction fields that carried data.
pub(crate) fn strip(table: &ResolvedTable, record: &mut Record) -> Vec<String> {
    let dropped = table
        .junctions
        .iter()
        .filter(|j| record.contains_key(&j.field))
        .map(|j| j.field.clone())
        .collect();
    record.retain(|k, _| !table.is_relation_field(k));
    dropped
}

/// Replace junction rows for every field present in `writes`; an empty list clears the association.
pub(crate) async fn sync(
    conn: &mut PgConnection,
    table: &ResolvedTable,
    id: &Value,
    writes: &[RelationWrite],
) -> Result<(), EngineError> {
    for w in writes {
        let Some(j) = table.junction(&w.field) else { continue };
        let removed = rows::execute(&mut *conn, &delete_junction_rows(table, j, id)).await?;
        if !w.targets.is_empty() {
            let q = insert_junction_rows(table, j, id, &w.targets, j.target_type.as_deref());
            rows::execute(&mut *conn, &q).await?;
        }
        tracing::debug!(
            junction = %j.junction_table,
            removed,
            inserted = w.targets.len(),
            "relation synced"
        );
    }
    Ok(())
}

/// Put the written relation values back on the returned row.
pub(crate) fn merge(row: &mut Value, writes: Vec<RelationWrite>) {
    if let Value::Object(map) = row {
        for w in writes {
            map.insert(w.field, Value::Array(w.targets));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use serde_json::json;

    fn posts() -> ResolvedTable {
        resolve(
            &TableConfig::new("posts")
                .column(ColumnConfig::new("title"))
                .column(ColumnConfig::typed("author_id", "integer"))
                .relation(RelationConfig::BelongsToMany(BelongsToMany {
                    field: "tagIds".into(),
                    junction_table: "post_tags".into(),
                    source_column: "post_id".into(),
                    target_column: "tag_id".into(),
                    junction_schema: None,
                    target_type: None,
                }))
                .relation(RelationConfig::BelongsToManyObject(BelongsToManyObject {
                    field: "categories".into(),
                    junction_table: "post_categories".into(),
                    source_column: "post_id".into(),
                    target_column: "category_id".into(),
                    target_table: "categories".into(),
                    target_key: "id".into(),
                    junction_schema: None,
                    target_schema: None,
                    target_type: None,
                }))
                .relation(RelationConfig::BelongsTo(BelongsTo {
                    field: "author".into(),
                    foreign_key: "author_id".into(),
                    target_table: "users".into(),
                    target_key: "id".into(),
                    target_schema: None,
                    nested: Vec::new(),
                })),
        )
        .unwrap()
    }

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn split_removes_relation_fields_and_dedupes() {
        let t = posts();
        let mut r = record(json!({
            "title": "hello",
            "tagIds": [3, 1, 3, 2, 1],
            "author": { "id": 7 },
            "_count": { "comments": 2 }
        }));
        let writes = split(&t, &mut r).unwrap();
        assert_eq!(writes, vec![RelationWrite { field: "tagIds".into(), targets: vec![json!(3), json!(1), json!(2)] }]);
        assert_eq!(r.len(), 1);
        assert_eq!(r["title"], json!("hello"));
    }

    #[test]
    fn omitted_field_is_untouched_and_empty_array_clears() {
        let t = posts();
        let mut r = record(json!({ "title": "x" }));
        assert!(split(&t, &mut r).unwrap().is_empty());
        let mut r = record(json!({ "tagIds": [] }));
        let writes = split(&t, &mut r).unwrap();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].targets.is_empty());
    }

    #[test]
    fn object_relation_accepts_ids_and_objects() {
        let t = posts();
        let mut r = record(json!({ "categories": [{ "id": "a", "name": "A" }, "b", { "id": "a" }] }));
        let writes = split(&t, &mut r).unwrap();
        assert_eq!(writes[0].targets, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn non_array_and_bad_items_are_rejected() {
        let t = posts();
        let mut r = record(json!({ "tagIds": 5 }));
        assert!(matches!(
            split(&t, &mut r),
            Err(EngineError::Validation { field: Some(f), .. }) if f == "tagIds"
        ));
        let mut r = record(json!({ "tagIds": [{ "id": 1 }] }));
        assert!(split(&t, &mut r).is_err());
        let mut r = record(json!({ "categories": [{ "name": "no key" }] }));
        assert!(split(&t, &mut r).is_err());
        let mut r = record(json!({ "tagIds": [null] }));
        assert!(split(&t, &mut r).is_err());
    }

    #[test]
    fn strip_reports_only_junction_fields() {
        let t = posts();
        let mut r = record(json!({ "title": "x", "tagIds": [1], "author": {}, "categories": ["c"] }));
        let mut dropped = strip(&t, &mut r);
        dropped.sort();
        assert_eq!(dropped, vec!["categories", "tagIds"]);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn merge_writes_back_targets() {
        let mut row = json!({ "id": 1, "title": "x" });
        merge(&mut row, vec![RelationWrite { field: "tagIds".into(), targets: vec![json!(2)] }]);
        assert_eq!(row["tagIds"], json!([2]));
    }
}
