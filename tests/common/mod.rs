//! Shared setup for tests against a live PostgreSQL. Each test gets its own schema.
#![allow(dead_code)]

use entity_engine::config::{BelongsTo, BelongsToMany, BelongsToManyObject, ColumnConfig, Countable, RelationConfig};
use entity_engine::{EntityService, TableConfig};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub struct TestDb {
    pub pool: PgPool,
    pub schema: String,
}

fn ddl(s: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA {s}"),
        format!("CREATE TABLE {s}.categories (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), name text NOT NULL)"),
        format!("CREATE TABLE {s}.tags (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), name text NOT NULL UNIQUE)"),
        format!(
            "CREATE TABLE {s}.products (
                id uuid PRIMARY KEY,
                code text UNIQUE,
                name text NOT NULL,
                price numeric,
                category_id uuid REFERENCES {s}.categories(id),
                sort_order text,
                created_at timestamptz NOT NULL DEFAULT NOW(),
                updated_at timestamptz NOT NULL DEFAULT NOW(),
                deleted_at timestamptz
            )"
        ),
        format!(
            "CREATE TABLE {s}.product_tags (
                product_id uuid NOT NULL REFERENCES {s}.products(id),
                tag_id uuid NOT NULL REFERENCES {s}.tags(id),
                PRIMARY KEY (product_id, tag_id)
            )"
        ),
        format!("CREATE TABLE {s}.notes (id serial PRIMARY KEY, body text NOT NULL, author text)"),
    ]
}

/// None when DATABASE_URL is not set; the caller skips.
pub async fn setup() -> Option<TestDb> {
    dotenvy::dotenv().ok();
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping");
        return None;
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    let schema = format!("ee_{}", uuid::Uuid::new_v4().simple());
    for stmt in ddl(&schema) {
        sqlx::query(&stmt).execute(&pool).await.expect("create test tables");
    }
    Some(TestDb { pool, schema })
}

impl TestDb {
    pub fn products_config(&self) -> TableConfig {
        TableConfig::new("products")
            .schema(&self.schema)
            .uuid_ids()
            .timestamps()
            .soft_delete("deleted_at")
            .sortable("sort_order")
            .column(ColumnConfig::typed("id", "uuid"))
            .column(ColumnConfig::new("code"))
            .column(ColumnConfig::new("name"))
            .column(ColumnConfig::typed("price", "numeric"))
            .column(ColumnConfig::typed("category_id", "uuid"))
            .search(&["name", "code"])
            .relation(RelationConfig::BelongsTo(BelongsTo {
                field: "category".into(),
                foreign_key: "category_id".into(),
                target_table: "categories".into(),
                target_key: "id".into(),
                target_schema: None,
                nested: Vec::new(),
            }))
            .relation(RelationConfig::BelongsToMany(BelongsToMany {
                field: "tagIds".into(),
                junction_table: "product_tags".into(),
                source_column: "product_id".into(),
                target_column: "tag_id".into(),
                junction_schema: None,
                target_type: None,
            }))
            .relation(RelationConfig::BelongsToManyObject(BelongsToManyObject {
                field: "tags".into(),
                junction_table: "product_tags".into(),
                source_column: "product_id".into(),
                target_column: "tag_id".into(),
                target_table: "tags".into(),
                target_key: "id".into(),
                junction_schema: None,
                target_schema: None,
                target_type: None,
            }))
            .relation(RelationConfig::Countable(Countable {
                field: "tags".into(),
                table: "product_tags".into(),
                foreign_key: "product_id".into(),
                schema: None,
            }))
    }

    pub fn products(&self) -> EntityService {
        EntityService::new(self.pool.clone(), self.products_config()).expect("products config")
    }

    pub fn tags(&self) -> EntityService {
        let cfg = TableConfig::new("tags")
            .schema(&self.schema)
            .column(ColumnConfig::typed("id", "uuid").with_default())
            .column(ColumnConfig::new("name"))
            .search(&["name"]);
        EntityService::new(self.pool.clone(), cfg).expect("tags config")
    }

    pub fn categories(&self) -> EntityService {
        let cfg = TableConfig::new("categories")
            .schema(&self.schema)
            .column(ColumnConfig::typed("id", "uuid").with_default())
            .column(ColumnConfig::new("name"));
        EntityService::new(self.pool.clone(), cfg).expect("categories config")
    }

    /// Plain table: serial id, no soft delete, no sort column.
    pub fn notes(&self) -> EntityService {
        let cfg = TableConfig::new("notes")
            .schema(&self.schema)
            .column(ColumnConfig::typed("id", "integer").with_default())
            .column(ColumnConfig::new("body"))
            .column(ColumnConfig::new("author"))
            .search(&["body"]);
        EntityService::new(self.pool.clone(), cfg).expect("notes config")
    }

    pub async fn tag(&self, name: &str) -> Value {
        self.tags()
            .create(serde_json::json!({ "name": name }))
            .await
            .expect("create tag")["id"]
            .clone()
    }

    /// Tag ids linked to a product, straight from the junction table, sorted.
    pub async fn junction_tags(&self, product_id: &Value) -> Vec<String> {
        let sql = format!(
            "SELECT tag_id::text FROM {}.product_tags WHERE product_id = $1::uuid ORDER BY 1",
            self.schema
        );
        sqlx::query_scalar(&sql)
            .bind(product_id.as_str().expect("uuid id"))
            .fetch_all(&self.pool)
            .await
            .expect("read junction")
    }

    pub async fn cleanup(self) {
        let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.pool)
            .await;
        self.pool.close().await;
    }
}

/// String ids of a result page, in order.
pub fn ids(rows: &[Value]) -> Vec<String> {
    rows.iter().map(|r| r["id"].as_str().unwrap_or_default().to_string()).collect()
}

pub fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}
