//! Builds parameterized statements for one resolved table. Identifiers come from config only; values are parameters.

use crate::config::{BelongsTo, JunctionRelation, ResolvedTable};
use serde_json::Value;
use std::collections::HashMap;

/// Alias of the entity table in every statement.
pub const MAIN_ALIAS: &str = "main";

/// Quote identifier for PostgreSQL (safe: only from config).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

/// `main."col"`
pub fn column_ref(col: &str) -> String {
    format!("{}.{}", MAIN_ALIAS, quoted(col))
}

fn cast_placeholder(n: u32, pg_type: Option<&str>) -> String {
    match pg_type {
        Some(t) => format!("${}::{}", n, t),
        None => format!("${}", n),
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    pub fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// Push a value and return its placeholder, cast when the column type is known.
    pub fn placeholder(&mut self, v: Value, pg_type: Option<&str>) -> String {
        let n = self.push_param(v);
        cast_placeholder(n, pg_type)
    }
}

/// Which relation expansions to add to a SELECT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hydration {
    pub relations: bool,
    pub count: bool,
}

/// SELECT list over `main`: custom enum (schema.typename) and numeric columns as text so decoding stays lossless.
pub fn select_column_list(table: &ResolvedTable) -> String {
    table
        .columns
        .iter()
        .map(|c| {
            let pg_type = c.pg_type.as_deref().unwrap_or("");
            let expr = if pg_type.contains('.') || pg_type.starts_with("numeric") {
                format!("{}::text", column_ref(&c.name))
            } else {
                column_ref(&c.name)
            };
            format!("{} AS {}", expr, quoted(&c.name))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn belongs_to_subquery(b: &BelongsTo, parent_alias: &str, depth: usize, default_schema: &str) -> String {
    let alias = format!("t{}", depth);
    let schema = b.target_schema.as_deref().unwrap_or(default_schema);
    let mut cols = vec![format!("{}.*", alias)];
    for n in &b.nested {
        cols.push(format!(
            "{} AS {}",
            belongs_to_subquery(n, &alias, depth + 1, default_schema),
            quoted(&n.field)
        ));
    }
    format!(
        "(SELECT row_to_json(r{d}) FROM (SELECT {cols} FROM {table} {alias} WHERE {alias}.{key} = {parent}.{fk}) r{d})",
        d = depth,
        cols = cols.join(", "),
        table = qualified_table(schema, &b.target_table),
        alias = alias,
        key = quoted(&b.target_key),
        parent = parent_alias,
        fk = quoted(&b.foreign_key),
    )
}

fn junction_subquery(j: &JunctionRelation, id_column: &str) -> String {
    let junction = qualified_table(&j.schema_name, &j.junction_table);
    match &j.target {
        None => format!(
            "(SELECT COALESCE(json_agg(j.{tc} ORDER BY j.{tc}), '[]'::json) FROM {junction} j WHERE j.{sc} = {id})",
            tc = quoted(&j.target_column),
            junction = junction,
            sc = quoted(&j.source_column),
            id = column_ref(id_column),
        ),
        Some(t) => format!(
            "(SELECT COALESCE(json_agg(row_to_json(t) ORDER BY t.{key}), '[]'::json) FROM {junction} j JOIN {target} t ON t.{key} = j.{tc} WHERE j.{sc} = {id})",
            key = quoted(&t.key_column),
            junction = junction,
            target = qualified_table(&t.schema_name, &t.table_name),
            tc = quoted(&j.target_column),
            sc = quoted(&j.source_column),
            id = column_ref(id_column),
        ),
    }
}

/// Extra SELECT expressions for the requested expansions, each a scalar subquery correlated on `main`.
pub fn hydration_columns(table: &ResolvedTable, hydration: Hydration) -> Vec<String> {
    let mut out = Vec::new();
    if hydration.relations {
        for b in &table.belongs_to {
            out.push(format!(
                "{} AS {}",
                belongs_to_subquery(b, MAIN_ALIAS, 0, &table.default_schema),
                quoted(&b.field)
            ));
        }
        for j in &table.junctions {
            out.push(format!("{} AS {}", junction_subquery(j, &table.id_column), quoted(&j.field)));
        }
    }
    if hydration.count && !table.countables.is_empty() {
        let pairs: Vec<String> = table
            .countables
            .iter()
            .map(|c| {
                let schema = c.schema.as_deref().unwrap_or(&table.default_schema);
                format!(
                    "'{}', (SELECT COUNT(*) FROM {} c WHERE c.{} = {})",
                    c.field,
                    qualified_table(schema, &c.table),
                    quoted(&c.foreign_key),
                    column_ref(&table.id_column)
                )
            })
            .collect();
        out.push(format!("json_build_object({}) AS \"_count\"", pairs.join(", ")));
    }
    out
}

fn from_main(table: &ResolvedTable) -> String {
    format!("{} {}", qualified_table(&table.schema_name, &table.table_name), MAIN_ALIAS)
}

fn target_main(table: &ResolvedTable) -> String {
    format!("{} AS {}", qualified_table(&table.schema_name, &table.table_name), MAIN_ALIAS)
}

fn live_filter(table: &ResolvedTable, include_deleted: bool) -> String {
    match (&table.deleted_at, include_deleted) {
        (Some(d), false) => format!(" AND {} IS NULL", column_ref(d)),
        _ => String::new(),
    }
}

fn id_placeholder(table: &ResolvedTable, q: &mut QueryBuf, id: &Value) -> String {
    let pg_type = table.id_info().and_then(|c| c.pg_type.as_deref());
    q.placeholder(id.clone(), pg_type)
}

fn id_list(table: &ResolvedTable, q: &mut QueryBuf, ids: &[Value]) -> String {
    ids.iter().map(|id| id_placeholder(table, q, id)).collect::<Vec<_>>().join(", ")
}

/// SELECT by id, optionally including soft-deleted rows and relation expansions.
pub fn select_by_id(table: &ResolvedTable, id: &Value, include_deleted: bool, hydration: Hydration) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    let mut cols = vec![select_column_list(table)];
    cols.extend(hydration_columns(table, hydration));
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {}{}",
        cols.join(", "),
        from_main(table),
        column_ref(&table.id_column),
        ph,
        live_filter(table, include_deleted)
    );
    q
}

/// Page SELECT over a predicate already lowered into `q`.
pub fn select_page(
    table: &ResolvedTable,
    q: &QueryBuf,
    predicate: &str,
    order: &[String],
    limit: u32,
    offset: u64,
    hydration: Hydration,
) -> QueryBuf {
    let mut cols = vec![select_column_list(table)];
    cols.extend(hydration_columns(table, hydration));
    let order_clause = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    QueryBuf {
        sql: format!(
            "SELECT {} FROM {} WHERE {}{} LIMIT {} OFFSET {}",
            cols.join(", "),
            from_main(table),
            predicate,
            order_clause,
            limit,
            offset
        ),
        params: q.params.clone(),
    }
}

/// COUNT(*) over the same predicate and params as a page query.
pub fn select_count(table: &ResolvedTable, q: &QueryBuf, predicate: &str) -> QueryBuf {
    QueryBuf {
        sql: format!("SELECT COUNT(*) FROM {} WHERE {}", from_main(table), predicate),
        params: q.params.clone(),
    }
}

/// Column names of `body` that exist on the table, in table order.
fn body_columns<'a>(table: &'a ResolvedTable, body: &HashMap<String, Value>) -> Vec<&'a crate::config::ColumnInfo> {
    table.columns.iter().filter(|c| body.contains_key(&c.name)).collect()
}

/// INSERT one row. Columns absent from the body are left to the DB (default or NULL); configured timestamps default to NOW().
pub fn insert(table: &ResolvedTable, body: &HashMap<String, Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for c in &table.columns {
        if let Some(v) = body.get(&c.name) {
            cols.push(quoted(&c.name));
            values.push(q.placeholder(v.clone(), c.pg_type.as_deref()));
        } else if is_timestamp(table, &c.name) {
            cols.push(quoted(&c.name));
            values.push("NOW()".into());
        }
    }
    let values_clause = if cols.is_empty() {
        " DEFAULT VALUES".to_string()
    } else {
        format!(" ({}) VALUES ({})", cols.join(", "), values.join(", "))
    };
    q.sql = format!(
        "INSERT INTO {}{} RETURNING {}",
        target_main(table),
        values_clause,
        select_column_list(table)
    );
    q
}

fn is_timestamp(table: &ResolvedTable, col: &str) -> bool {
    table.created_at.as_deref() == Some(col) || table.updated_at.as_deref() == Some(col)
}

/// UPDATE by id: SET only body columns (never id or created_at); stamps updated_at.
/// With nothing to set, falls back to selecting the row so callers still get it back.
pub fn update(table: &ResolvedTable, id: &Value, body: &HashMap<String, Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for c in body_columns(table, body) {
        if c.name == table.id_column || table.created_at.as_deref() == Some(c.name.as_str()) {
            continue;
        }
        if table.updated_at.as_deref() == Some(c.name.as_str()) {
            continue;
        }
        let v = body.get(&c.name).cloned().unwrap_or(Value::Null);
        let rhs = q.placeholder(v, c.pg_type.as_deref());
        sets.push(format!("{} = {}", quoted(&c.name), rhs));
    }
    if sets.is_empty() {
        return select_by_id(table, id, true, Hydration::default());
    }
    if let Some(u) = &table.updated_at {
        sets.push(format!("{} = NOW()", quoted(u)));
    }
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        target_main(table),
        sets.join(", "),
        column_ref(&table.id_column),
        ph,
        select_column_list(table)
    );
    q
}

/// Stamp `updated_at` alone, for updates that only rewrite relations. A plain read when the
/// table has no such column.
pub fn touch(table: &ResolvedTable, id: &Value) -> QueryBuf {
    let Some(u) = &table.updated_at else {
        return select_by_id(table, id, true, Hydration::default());
    };
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "UPDATE {} SET {} = NOW() WHERE {} = {} RETURNING {}",
        target_main(table),
        quoted(u),
        column_ref(&table.id_column),
        ph,
        select_column_list(table)
    );
    q
}

/// Conflict handling for insert-or-update statements.
#[derive(Clone, Debug)]
pub struct ConflictSpec<'a> {
    pub target: &'a [String],
    pub exclude_from_update: &'a [String],
    pub skip_duplicates: bool,
}

/// Multi-row INSERT … ON CONFLICT. Columns are the union over rows; a row lacking one uses DEFAULT
/// (or NOW() for configured timestamps). The update clause never touches the id, created_at,
/// the conflict columns, or excluded fields.
pub fn upsert_rows(table: &ResolvedTable, rows: &[HashMap<String, Value>], conflict: &ConflictSpec<'_>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cols: Vec<&crate::config::ColumnInfo> = table
        .columns
        .iter()
        .filter(|c| is_timestamp(table, &c.name) || rows.iter().any(|r| r.contains_key(&c.name)))
        .collect();

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let vals: Vec<String> = cols
            .iter()
            .map(|c| match row.get(&c.name) {
                Some(v) => q.placeholder(v.clone(), c.pg_type.as_deref()),
                None if is_timestamp(table, &c.name) => "NOW()".to_string(),
                None => "DEFAULT".to_string(),
            })
            .collect();
        tuples.push(format!("({})", vals.join(", ")));
    }

    let action = if conflict.skip_duplicates {
        "DO NOTHING".to_string()
    } else {
        let mut sets: Vec<String> = cols
            .iter()
            .filter(|c| {
                c.name != table.id_column
                    && table.created_at.as_deref() != Some(c.name.as_str())
                    && !conflict.target.contains(&c.name)
                    && !conflict.exclude_from_update.contains(&c.name)
            })
            .map(|c| format!("{} = EXCLUDED.{}", quoted(&c.name), quoted(&c.name)))
            .collect();
        if sets.is_empty() {
            // no-op assignment so RETURNING still yields the existing row
            let first = quoted(&conflict.target[0]);
            sets.push(format!("{} = EXCLUDED.{}", first, first));
        }
        format!("DO UPDATE SET {}", sets.join(", "))
    };

    q.sql = format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {} RETURNING {}",
        target_main(table),
        cols.iter().map(|c| quoted(&c.name)).collect::<Vec<_>>().join(", "),
        tuples.join(", "),
        conflict.target.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", "),
        action,
        select_column_list(table)
    );
    q
}

/// Hard DELETE by id.
pub fn delete(table: &ResolvedTable, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {} RETURNING {}",
        target_main(table),
        column_ref(&table.id_column),
        ph,
        select_column_list(table)
    );
    q
}

fn soft_delete_sets(table: &ResolvedTable, deleted_at: &str, value: &str) -> String {
    let mut sets = vec![format!("{} = {}", quoted(deleted_at), value)];
    if let Some(u) = &table.updated_at {
        sets.push(format!("{} = NOW()", quoted(u)));
    }
    sets.join(", ")
}

/// Soft delete by id; rows already deleted are left alone.
pub fn soft_delete(table: &ResolvedTable, deleted_at: &str, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} AND {} IS NULL RETURNING {}",
        target_main(table),
        soft_delete_sets(table, deleted_at, "NOW()"),
        column_ref(&table.id_column),
        ph,
        column_ref(deleted_at),
        select_column_list(table)
    );
    q
}

/// Clear the soft-delete column by id.
pub fn restore(table: &ResolvedTable, deleted_at: &str, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        target_main(table),
        soft_delete_sets(table, deleted_at, "NULL"),
        column_ref(&table.id_column),
        ph,
        select_column_list(table)
    );
    q
}

/// Delete (soft when `deleted_at` is given) every row matching a predicate already lowered into `q`.
pub fn delete_where(table: &ResolvedTable, q: &QueryBuf, predicate: &str, deleted_at: Option<&str>) -> QueryBuf {
    let sql = match deleted_at {
        Some(d) => format!(
            "UPDATE {} SET {} WHERE ({}) AND {} IS NULL",
            target_main(table),
            soft_delete_sets(table, d, "NOW()"),
            predicate,
            column_ref(d)
        ),
        None => format!("DELETE FROM {} WHERE {}", target_main(table), predicate),
    };
    QueryBuf {
        sql,
        params: q.params.clone(),
    }
}

/// Predicate `main.id IN (...)` bound into `q`.
pub fn id_in(table: &ResolvedTable, q: &mut QueryBuf, ids: &[Value]) -> String {
    if ids.is_empty() {
        return "FALSE".into();
    }
    format!("{} IN ({})", column_ref(&table.id_column), id_list(table, q, ids))
}

/// Sort key of a live row, `Some(None)` when the row exists without a key.
pub fn select_sort_key(table: &ResolvedTable, sort: &str, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {}{}",
        column_ref(sort),
        from_main(table),
        column_ref(&table.id_column),
        ph,
        live_filter(table, false)
    );
    q
}

/// Where a neighbour key is searched relative to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Neighbour<'a> {
    /// Smallest key strictly greater than the given one.
    After(&'a str),
    /// Smallest key overall.
    First,
    /// Largest key overall.
    Last,
}

/// Neighbour sort key across all rows (soft-deleted too, so a restore cannot collide), excluding one row.
pub fn select_neighbour_key(table: &ResolvedTable, sort: &str, neighbour: Neighbour<'_>, exclude_id: Option<&Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let key = column_ref(sort);
    let mut conds = vec![format!("{} IS NOT NULL", key)];
    let dir = match neighbour {
        Neighbour::After(k) => {
            let n = q.push_param(Value::String(k.to_string()));
            conds.push(format!("{} COLLATE \"C\" > ${}::text COLLATE \"C\"", key, n));
            "ASC"
        }
        Neighbour::First => "ASC",
        Neighbour::Last => "DESC",
    };
    if let Some(id) = exclude_id {
        let ph = id_placeholder(table, &mut q, id);
        conds.push(format!("{} <> {}", column_ref(&table.id_column), ph));
    }
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {} COLLATE \"C\" {} LIMIT 1",
        key,
        from_main(table),
        conds.join(" AND "),
        key,
        dir
    );
    q
}

/// Write a new sort key.
pub fn set_sort_key(table: &ResolvedTable, sort: &str, id: &Value, key: &str) -> QueryBuf {
    let mut body = HashMap::new();
    body.insert(sort.to_string(), Value::String(key.to_string()));
    update(table, id, &body)
}

/// Remove every junction row for one source id.
pub fn delete_junction_rows(table: &ResolvedTable, j: &JunctionRelation, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = id_placeholder(table, &mut q, id);
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        qualified_table(&j.schema_name, &j.junction_table),
        quoted(&j.source_column),
        ph
    );
    q
}

/// Remove junction rows of every entity row matching a predicate already lowered into `q`.
pub fn delete_junction_rows_where(table: &ResolvedTable, j: &JunctionRelation, q: &QueryBuf, predicate: &str) -> QueryBuf {
    QueryBuf {
        sql: format!(
            "DELETE FROM {} WHERE {} IN (SELECT {} FROM {} WHERE {})",
            qualified_table(&j.schema_name, &j.junction_table),
            quoted(&j.source_column),
            column_ref(&table.id_column),
            from_main(table),
            predicate
        ),
        params: q.params.clone(),
    }
}

/// One multi-row insert of (source, target) pairs; the source id is bound once.
pub fn insert_junction_rows(
    table: &ResolvedTable,
    j: &JunctionRelation,
    id: &Value,
    targets: &[Value],
    target_type: Option<&str>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let source = id_placeholder(table, &mut q, id);
    let tuples: Vec<String> = targets
        .iter()
        .map(|t| format!("({}, {})", source, q.placeholder(t.clone(), target_type)))
        .collect();
    q.sql = format!(
        "INSERT INTO {} ({}, {}) VALUES {}",
        qualified_table(&j.schema_name, &j.junction_table),
        quoted(&j.source_column),
        quoted(&j.target_column),
        tuples.join(", ")
    );
    q
}

/// Tables cleared by truncate_all: junctions first, then the entity table.
pub fn truncate_tables(table: &ResolvedTable) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for j in &table.junctions {
        let name = qualified_table(&j.schema_name, &j.junction_table);
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out.push(qualified_table(&table.schema_name, &table.table_name));
    out
}

pub fn truncate(tables: &[String]) -> QueryBuf {
    QueryBuf {
        sql: format!("TRUNCATE TABLE {} RESTART IDENTITY", tables.join(", ")),
        params: Vec::new(),
    }
}
