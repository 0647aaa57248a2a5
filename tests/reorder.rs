//! Reordering against a live database (set DATABASE_URL; skipped otherwise).

mod common;

use async_trait::async_trait;
use common::{ids, TestDb};
use entity_engine::ordering::JITTER_LEN;
use entity_engine::{key_between, EngineError, EntityService, ListParams, ResolvedTable, SortKeyRebalancer};
use serde_json::{json, Value};
use sqlx::PgConnection;
use std::collections::HashSet;
use std::sync::Arc;

async fn make(products: &EntityService, names: &[&str]) -> Vec<Value> {
    let mut out = Vec::new();
    for n in names {
        out.push(products.create(json!({ "name": n })).await.unwrap());
    }
    out
}

async fn order(products: &EntityService) -> Vec<String> {
    let page = products
        .list(ListParams {
            limit: Some(1000),
            ..Default::default()
        })
        .await
        .unwrap();
    ids(&page.results)
}

async fn sort_keys(db: &TestDb) -> Vec<String> {
    let sql = format!(
        "SELECT sort_order FROM {}.products WHERE sort_order IS NOT NULL ORDER BY sort_order COLLATE \"C\"",
        db.schema
    );
    sqlx::query_scalar(&sql).fetch_all(&db.pool).await.unwrap()
}

#[tokio::test]
async fn move_after_anchor() {
    let Some(db) = common::setup().await else { return };
    let products = db.products();
    let rows = make(&products, &["A", "B", "C"]).await;
    let (a, b, c) = (&rows[0]["id"], &rows[1]["id"], &rows[2]["id"]);

    let moved = products.reorder(c, Some(a)).await.unwrap().unwrap();
    assert_eq!(moved["id"], *c);
    // hydrated because the table has junction relations
    assert_eq!(moved["tagIds"], json!([]));
    assert_eq!(order(&products).await, ids(&[rows[0].clone(), rows[2].clone(), rows[1].clone()]));
    // untouched rows keep their keys
    let untouched = products.get(b, Default::default()).await.unwrap().unwrap();
    assert_eq!(untouched["sort_order"], rows[1]["sort_order"]);

    products.reorder(b, None).await.unwrap();
    assert_eq!(order(&products).await, ids(&[rows[1].clone(), rows[0].clone(), rows[2].clone()]));

    let missing = json!(uuid::Uuid::new_v4().to_string());
    assert!(products.reorder(&missing, Some(a)).await.unwrap().is_none());
    db.cleanup().await;
}

#[tokio::test]
async fn unusable_anchors_place_first() {
    let Some(db) = common::setup().await else { return };
    let products = db.products();
    let rows = make(&products, &["A", "B", "C", "D"]).await;
    let id = |i: usize| rows[i]["id"].clone();
    let first = |order: Vec<String>| order[0].clone();
    let s = |v: Value| v.as_str().unwrap().to_string();

    let missing = json!(uuid::Uuid::new_v4().to_string());
    products.reorder(&id(2), Some(&missing)).await.unwrap();
    assert_eq!(first(order(&products).await), s(id(2)));

    products.reorder(&id(3), Some(&id(3))).await.unwrap();
    assert_eq!(first(order(&products).await), s(id(3)));

    products.remove(&id(0)).await.unwrap();
    products.reorder(&id(1), Some(&id(0))).await.unwrap();
    assert_eq!(first(order(&products).await), s(id(1)));
    db.cleanup().await;
}

#[tokio::test]
async fn anchor_without_key_appends() {
    let Some(db) = common::setup().await else { return };
    let products = db.products();
    let rows = make(&products, &["A", "B", "C"]).await;
    let sql = format!("UPDATE {}.products SET sort_order = NULL WHERE id = $1::uuid", db.schema);
    sqlx::query(&sql)
        .bind(rows[1]["id"].as_str().unwrap())
        .execute(&db.pool)
        .await
        .unwrap();

    let moved = products.reorder(&rows[0]["id"], Some(&rows[1]["id"])).await.unwrap().unwrap();
    let key = moved["sort_order"].as_str().unwrap().to_string();
    assert_eq!(sort_keys(&db).await.last(), Some(&key));
    assert!(key.as_str() > rows[2]["sort_order"].as_str().unwrap());
    db.cleanup().await;
}

/// Deterministic pseudo-random sequence.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, n: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % n as u64) as usize
    }
}

#[tokio::test]
async fn reorder_chain_keeps_a_total_order() {
    let Some(db) = common::setup().await else { return };
    let products = db.products();
    let names: Vec<String> = (0..8).map(|i| format!("item {}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let rows = make(&products, &refs).await;
    let mut model: Vec<String> = ids(&rows);
    let mut rng = Lcg(7);

    for _ in 0..60 {
        let moving = model[rng.below(model.len())].clone();
        let pick = rng.below(model.len() + 1);
        let anchor = model.get(pick).cloned();

        products
            .reorder(&json!(moving), anchor.as_ref().map(|a| json!(a)).as_ref())
            .await
            .unwrap()
            .unwrap();

        model.retain(|m| *m != moving);
        match anchor.filter(|a| *a != moving) {
            Some(a) => {
                let at = model.iter().position(|m| *m == a).unwrap();
                model.insert(at + 1, moving);
            }
            None => model.insert(0, moving),
        }
        assert_eq!(order(&products).await, model);
    }

    let keys = sort_keys(&db).await;
    assert_eq!(keys.len(), 8);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    db.cleanup().await;
}

/// Renumbers every row in current order with fresh append keys.
struct Renumber;

#[async_trait]
impl SortKeyRebalancer for Renumber {
    async fn rebalance(&self, conn: &mut PgConnection, table: &ResolvedTable) -> Result<(), EngineError> {
        let Some(sort) = table.sort_column.as_deref() else {
            return Ok(());
        };
        let target = format!("\"{}\".\"{}\"", table.schema_name, table.table_name);
        let select = format!(
            "SELECT \"{id}\"::text FROM {t} ORDER BY \"{s}\" COLLATE \"C\" ASC NULLS LAST, \"{id}\" ASC",
            id = table.id_column,
            t = target,
            s = sort
        );
        let ids: Vec<String> = sqlx::query_scalar(&select).fetch_all(&mut *conn).await?;
        let update = format!(
            "UPDATE {} SET \"{}\" = $1 WHERE \"{}\"::text = $2",
            target, sort, table.id_column
        );
        let mut last: Option<String> = None;
        for id in ids {
            let key = key_between(last.as_deref(), None)?;
            sqlx::query(&update).bind(&key).bind(&id).execute(&mut *conn).await?;
            last = Some(key);
        }
        Ok(())
    }
}

#[tokio::test]
async fn exhausted_keys_need_a_rebalancer() {
    let Some(db) = common::setup().await else { return };
    let products = db.products();
    let tight = format!("a0{}1", "0".repeat(125));
    let a = products.create(json!({ "name": "A", "sort_order": "a0" })).await.unwrap();
    let b = products.create(json!({ "name": "B", "sort_order": tight })).await.unwrap();
    let c = products.create(json!({ "name": "C" })).await.unwrap();
    assert!(c["sort_order"].as_str().unwrap().starts_with("a1"));

    let err = products.reorder(&c["id"], Some(&a["id"])).await.unwrap_err();
    assert!(matches!(err, EngineError::SortKeyExhausted { .. }));
    // nothing moved
    assert_eq!(order(&products).await, ids(&[a.clone(), b.clone(), c.clone()]));

    let products = products.with_rebalancer(Arc::new(Renumber));
    products.reorder(&c["id"], Some(&a["id"])).await.unwrap().unwrap();
    assert_eq!(order(&products).await, ids(&[a, c, b]));
    assert!(sort_keys(&db).await.iter().all(|k| k.len() <= 3 + JITTER_LEN));
    db.cleanup().await;
}

#[tokio::test]
async fn interleaved_writers_get_distinct_keys() {
    let Some(db) = common::setup().await else { return };
    let products = db.products();
    let rows = make(&products, &["A", "B", "X", "Y"]).await;
    let key = |row: &Value| row["sort_order"].as_str().unwrap().to_string();

    // both transactions see A and B as neighbours before either commits
    let mut t1 = db.pool.begin().await.unwrap();
    let mut t2 = db.pool.begin().await.unwrap();
    let x = products.reorder_in(&mut t1, &rows[2]["id"], Some(&rows[0]["id"])).await.unwrap().unwrap();
    let y = products.reorder_in(&mut t2, &rows[3]["id"], Some(&rows[0]["id"])).await.unwrap().unwrap();
    t1.commit().await.unwrap();
    t2.commit().await.unwrap();
    assert_ne!(key(&x), key(&y));
    let between = |k: String| key(&rows[0]) < k && k < key(&rows[1]);
    assert!(between(key(&x)) && between(key(&y)));

    // both appends read the same last key
    let mut t3 = db.pool.begin().await.unwrap();
    let mut t4 = db.pool.begin().await.unwrap();
    let c1 = products.create_in(&mut t3, json!({ "name": "C1" })).await.unwrap();
    let c2 = products.create_in(&mut t4, json!({ "name": "C2" })).await.unwrap();
    t3.commit().await.unwrap();
    t4.commit().await.unwrap();
    assert_ne!(key(&c1), key(&c2));

    let keys = sort_keys(&db).await;
    assert_eq!(keys.len(), 6);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let listed = order(&products).await;
    let s = |row: &Value| row["id"].as_str().unwrap().to_string();
    assert_eq!(listed[0], s(&rows[0]));
    assert_eq!(listed[3], s(&rows[1]));
    let middle: HashSet<String> = listed[1..3].iter().cloned().collect();
    assert_eq!(middle, HashSet::from([s(&rows[2]), s(&rows[3])]));
    let tail: HashSet<String> = listed[4..].iter().cloned().collect();
    assert_eq!(tail, HashSet::from([s(&c1), s(&c2)]));
    db.cleanup().await;
}
