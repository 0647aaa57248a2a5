//! Example consumer: a separate Rust project that uses entity-engine as a dependency.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Needs DATABASE_URL (a `.env` file works). Creates a `demo` schema, runs a short scenario,
//! then serves the products table on 127.0.0.1:3000.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use entity_engine::config::{BelongsTo, BelongsToMany, ColumnConfig, Countable, RelationConfig};
use entity_engine::{
    BulkUpsertOptions, EngineError, EntityService, FilterExpr, OrderBy, ReadOptions, SearchParams, TableConfig,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS demo",
    "CREATE TABLE IF NOT EXISTS demo.categories (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), name text NOT NULL UNIQUE)",
    "CREATE TABLE IF NOT EXISTS demo.tags (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), name text NOT NULL UNIQUE)",
    "CREATE TABLE IF NOT EXISTS demo.products (
        id uuid PRIMARY KEY,
        code text NOT NULL UNIQUE,
        name text NOT NULL,
        price numeric,
        category_id uuid REFERENCES demo.categories(id),
        sort_order text COLLATE \"C\" UNIQUE,
        created_at timestamptz NOT NULL DEFAULT NOW(),
        updated_at timestamptz NOT NULL DEFAULT NOW(),
        deleted_at timestamptz
    )",
    "CREATE TABLE IF NOT EXISTS demo.product_tags (
        product_id uuid NOT NULL REFERENCES demo.products(id),
        tag_id uuid NOT NULL REFERENCES demo.tags(id),
        PRIMARY KEY (product_id, tag_id)
    )",
];

fn products_config() -> TableConfig {
    TableConfig::new("products")
        .schema("demo")
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
            target_type: Some("uuid".into()),
        }))
        .relation(RelationConfig::Countable(Countable {
            field: "tags".into(),
            table: "product_tags".into(),
            foreign_key: "product_id".into(),
            schema: None,
        }))
}

async fn scenario(products: &EntityService, tags: &EntityService) -> Result<(), EngineError> {
    products.truncate_all().await?;

    let seeded = tags
        .bulk_upsert(
            vec![json!({ "name": "red" }), json!({ "name": "sale" }), json!({ "name": "new" })],
            &BulkUpsertOptions {
                conflict_target: vec!["name".into()],
                ..Default::default()
            },
        )
        .await?;
    let tag_ids: Vec<Value> = seeded.iter().map(|t| t["id"].clone()).collect();

    let a = products
        .create(json!({ "code": "A-1", "name": "Red Apple", "price": "1.20", "tagIds": [tag_ids[0], tag_ids[1]] }))
        .await?;
    let b = products.create(json!({ "code": "B-1", "name": "Banana", "price": "0.50" })).await?;
    let c = products.create(json!({ "code": "C-1", "name": "Cherry", "price": "3.10" })).await?;
    tracing::info!(a = %a["sort_order"], b = %b["sort_order"], c = %c["sort_order"], "created");

    products.reorder(&c["id"], Some(&a["id"])).await?;
    let page = products.list(Default::default()).await?;
    let order: Vec<&Value> = page.results.iter().map(|r| &r["code"]).collect();
    tracing::info!(order = ?order, total = page.total, "after moving C behind A");

    products.update(&a["id"], json!({ "tagIds": [tag_ids[1], tag_ids[2]] })).await?;
    let hydrated = products
        .get(&a["id"], ReadOptions { with_relations: true, with_count: true })
        .await?;
    tracing::info!(row = ?hydrated, "hydrated");

    let found = products
        .search(SearchParams {
            search_query: "RED".into(),
            order_by: vec![OrderBy::asc("name")],
            ..Default::default()
        })
        .await?;
    tracing::info!(hits = found.total, "search 'RED'");

    products.remove(&b["id"]).await?;
    let live = products
        .list(entity_engine::ListParams {
            filter: Some(FilterExpr::eq("code", json!("B-1"))),
            ..Default::default()
        })
        .await?;
    tracing::info!(visible = live.total, "after soft delete");

    let copy = products.duplicate(&c["id"]).await?;
    tracing::info!(copy = ?copy.map(|r| r["name"].clone()), "duplicated");
    Ok(())
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct MoveBody {
    after: Option<Value>,
}

fn found(row: Option<Value>) -> Response {
    match row {
        Some(r) => Json(r).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn search_products(
    State(svc): State<EntityService>,
    Query(params): Query<SearchQuery>,
) -> Result<Response, EngineError> {
    let page = svc
        .search(SearchParams {
            search_query: params.q,
            page: params.page,
            limit: params.limit,
            with_relations: true,
            ..Default::default()
        })
        .await?;
    Ok(Json(page).into_response())
}

async fn create_product(State(svc): State<EntityService>, Json(body): Json<Value>) -> Result<Response, EngineError> {
    let row = svc.create(body).await?;
    Ok((StatusCode::CREATED, Json(row)).into_response())
}

async fn get_product(State(svc): State<EntityService>, Path(id): Path<String>) -> Result<Response, EngineError> {
    let opts = ReadOptions {
        with_relations: true,
        with_count: true,
    };
    Ok(found(svc.get(&Value::String(id), opts).await?))
}

async fn update_product(
    State(svc): State<EntityService>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, EngineError> {
    Ok(found(svc.update(&Value::String(id), body).await?))
}

async fn delete_product(State(svc): State<EntityService>, Path(id): Path<String>) -> Result<Response, EngineError> {
    Ok(found(svc.remove(&Value::String(id)).await?))
}

async fn move_product(
    State(svc): State<EntityService>,
    Path(id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Result<Response, EngineError> {
    Ok(found(svc.reorder(&Value::String(id), body.after.as_ref()).await?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("entity_engine=info,example_consumer=info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/entity_engine".into());
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let products = EntityService::new(pool.clone(), products_config())?;
    let tags = EntityService::new(
        pool.clone(),
        TableConfig::new("tags")
            .schema("demo")
            .column(ColumnConfig::typed("id", "uuid").with_default())
            .column(ColumnConfig::new("name")),
    )?;
    for stmt in DDL {
        products.query(stmt, &[]).await?;
    }
    scenario(&products, &tags).await?;

    let app = Router::new()
        .route("/products", get(search_products).post(create_product))
        .route("/products/:id", get(get_product).patch(update_product).delete(delete_product))
        .route("/products/:id/move", post(move_product))
        .with_state(products);
    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Example consumer listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
