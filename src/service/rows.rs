//! Statement execution over any Postgres executor, rows decoded to JSON.

use crate::error::{translate, EngineError};
use crate::sql::{PgBindValue, QueryBuf};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Executor, Postgres, Row};

fn bind(q: &QueryBuf) -> Query<'_, Postgres, PgArguments> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(PgBindValue::from_json(p));
    }
    query
}

pub(crate) async fn fetch_optional<'c, E>(executor: E, q: &QueryBuf) -> Result<Option<Value>, EngineError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = bind(q).fetch_optional(executor).await.map_err(translate)?;
    Ok(row.map(|r| row_to_json(&r)))
}

/// For statements that always return a row (INSERT … RETURNING).
pub(crate) async fn fetch_one<'c, E>(executor: E, q: &QueryBuf) -> Result<Value, EngineError>
where
    E: Executor<'c, Database = Postgres>,
{
    fetch_optional(executor, q)
        .await?
        .ok_or(EngineError::Db(sqlx::Error::RowNotFound))
}

pub(crate) async fn fetch_all<'c, E>(executor: E, q: &QueryBuf) -> Result<Vec<Value>, EngineError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = bind(q).fetch_all(executor).await.map_err(translate)?;
    Ok(rows.iter().map(row_to_json).collect())
}

/// Rows affected.
pub(crate) async fn execute<'c, E>(executor: E, q: &QueryBuf) -> Result<u64, EngineError>
where
    E: Executor<'c, Database = Postgres>,
{
    let done = bind(q).execute(executor).await.map_err(translate)?;
    Ok(done.rows_affected())
}

/// First column of a single-row COUNT(*) query.
pub(crate) async fn fetch_count<'c, E>(executor: E, q: &QueryBuf) -> Result<u64, EngineError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = bind(q).fetch_one(executor).await.map_err(translate)?;
    let n: i64 = row.try_get(0)?;
    Ok(n.max(0) as u64)
}

pub(crate) fn row_to_json(row: &PgRow) -> Value {
    use sqlx::Column;
    let mut map = serde_json::Map::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    Value::Object(map)
}

/// Decode one cell by trying the types the engine selects. Numeric and enum columns arrive as text.
fn cell_to_value(row: &PgRow, name: &str) -> Value {
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
