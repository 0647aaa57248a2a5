//! EntityService: the full operation set for one configured table.
//!
//! Every write has a pool form that opens a transaction, runs the `*_in` form, and commits.
//! The `*_in` forms join a caller-owned transaction. An error anywhere drops the transaction
//! uncommitted, which rolls it back.

use crate::config::{resolve, IdStrategy, ResolvedTable, TableConfig};
use crate::error::{translate, ConfigError, EngineError};
use crate::ordering::{random_key_between, SortKeyRebalancer};
use crate::service::params::*;
use crate::service::relations;
use crate::service::rows;
use crate::service::validation::{PayloadValidator, RuleValidator, WriteOp};
use crate::sql::{
    build_order_by, build_search, build_where, column_ref, delete, delete_junction_rows, delete_junction_rows_where,
    delete_where, id_in, insert, qualified_table, restore, select_by_id, select_count, select_neighbour_key,
    select_page, select_sort_key, set_sort_key, soft_delete, touch, truncate, truncate_tables, update, upsert_rows,
    ConflictSpec, FilterExpr, Hydration, Neighbour, OrderBy, QueryBuf,
};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::sync::Arc;

/// PostgreSQL's bind parameter limit per statement.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct EntityService {
    pool: PgPool,
    table: Arc<ResolvedTable>,
    validator: Option<Arc<dyn PayloadValidator>>,
    rebalancer: Option<Arc<dyn SortKeyRebalancer>>,
}

fn into_record(data: Value) -> Result<Record, EngineError> {
    match data {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(EngineError::Validation {
            field: None,
            message: "payload must be a JSON object".into(),
        }),
    }
}

fn is_missing(record: &Record, col: &str) -> bool {
    record.get(col).map_or(true, Value::is_null)
}

/// In-batch identity of a record under the conflict target. Records with a missing or null key
/// never conflict, so they get none.
fn conflict_key(record: &Record, target: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(target.len());
    for col in target {
        match record.get(col) {
            None | Some(Value::Null) => return None,
            Some(v) => parts.push(v.clone()),
        }
    }
    Some(Value::Array(parts).to_string())
}

impl EntityService {
    /// Resolve and validate the config. A `RuleValidator` is installed when the config carries rules.
    pub fn new(pool: PgPool, config: TableConfig) -> Result<Self, ConfigError> {
        let table = resolve(&config)?;
        let validator: Option<Arc<dyn PayloadValidator>> = if table.validation.is_empty() {
            None
        } else {
            Some(Arc::new(RuleValidator::new(&table.validation)?))
        };
        tracing::debug!(
            table = %qualified_table(&table.schema_name, &table.table_name),
            junctions = table.junctions.len(),
            "entity service ready"
        );
        Ok(EntityService {
            pool,
            table: Arc::new(table),
            validator,
            rebalancer: None,
        })
    }

    /// Replace the payload validator.
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_rebalancer(mut self, rebalancer: Arc<dyn SortKeyRebalancer>) -> Self {
        self.rebalancer = Some(rebalancer);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &ResolvedTable {
        &self.table
    }

    /// Quoted `schema.table`.
    pub fn table_name(&self) -> String {
        qualified_table(&self.table.schema_name, &self.table.table_name)
    }

    async fn prepare(&self, op: WriteOp, data: Value) -> Result<Record, EngineError> {
        let record = into_record(data)?;
        match &self.validator {
            Some(v) => v.validate(op, &self.table, record).await,
            None => Ok(record),
        }
    }

    fn assign_id(&self, record: &mut Record) {
        if self.table.id_strategy == IdStrategy::Uuid && is_missing(record, &self.table.id_column) {
            record.insert(
                self.table.id_column.clone(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
    }

    fn require_sort_column(&self) -> Result<&str, ConfigError> {
        self.table
            .sort_column
            .as_deref()
            .ok_or_else(|| ConfigError::MissingColumn {
                table: self.table.table_name.clone(),
                what: "sort",
            })
    }

    fn require_deleted_at(&self) -> Result<&str, ConfigError> {
        self.table
            .deleted_at
            .as_deref()
            .ok_or_else(|| ConfigError::MissingColumn {
                table: self.table.table_name.clone(),
                what: "soft-delete",
            })
    }

    fn conflict_target(&self, target: &[String]) -> Result<Vec<String>, ConfigError> {
        if target.is_empty() {
            return Ok(vec![self.table.id_column.clone()]);
        }
        for col in target {
            if !self.table.has_column(col) {
                return Err(ConfigError::UnknownColumn {
                    table: self.table.table_name.clone(),
                    column: col.clone(),
                });
            }
        }
        Ok(target.to_vec())
    }

    async fn neighbour_key(
        &self,
        conn: &mut PgConnection,
        sort: &str,
        neighbour: Neighbour<'_>,
        exclude_id: Option<&Value>,
    ) -> Result<Option<String>, EngineError> {
        let q = select_neighbour_key(&self.table, sort, neighbour, exclude_id);
        let row = rows::fetch_optional(&mut *conn, &q).await?;
        Ok(row.and_then(|r| r.get(sort).and_then(Value::as_str).map(str::to_string)))
    }

    pub async fn create(&self, data: Value) -> Result<Value, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.create_in(&mut tx, data).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Insert one row and write its relation arrays. Returns the inserted row with the relation
    /// values that were written. Without a sort key in the payload the row is appended last.
    pub async fn create_in(&self, conn: &mut PgConnection, data: Value) -> Result<Value, EngineError> {
        let mut record = self.prepare(WriteOp::Create, data).await?;
        let writes = relations::split(&self.table, &mut record)?;
        self.assign_id(&mut record);
        if let Some(sort) = self.table.sort_column.as_deref() {
            if is_missing(&record, sort) {
                let last = self.neighbour_key(conn, sort, Neighbour::Last, None).await?;
                record.insert(sort.to_string(), Value::String(random_key_between(last.as_deref(), None)?));
            }
        }
        let mut row = rows::fetch_one(&mut *conn, &insert(&self.table, &record)).await?;
        let id = row.get(&self.table.id_column).cloned().unwrap_or(Value::Null);
        relations::sync(conn, &self.table, &id, &writes).await?;
        relations::merge(&mut row, writes);
        Ok(row)
    }

    pub async fn get(&self, id: &Value, opts: ReadOptions) -> Result<Option<Value>, EngineError> {
        let q = select_by_id(&self.table, id, false, opts.hydration());
        rows::fetch_optional(&self.pool, &q).await
    }

    /// Like `get`, but soft-deleted rows are returned too.
    pub async fn get_with_deleted(&self, id: &Value, opts: ReadOptions) -> Result<Option<Value>, EngineError> {
        let q = select_by_id(&self.table, id, true, opts.hydration());
        rows::fetch_optional(&self.pool, &q).await
    }

    pub async fn list(&self, params: ListParams) -> Result<Paginated<Value>, EngineError> {
        let window = PageWindow::new(params.page, params.limit)?;
        let mut q = QueryBuf::new();
        let mut conds = vec![build_where(params.filter.as_ref(), &self.table, &mut q)?];
        if !params.with_deleted {
            conds.extend(self.live_condition());
        }
        let order = self.order_clauses(&params.order_by, None, false);
        let hydration = Hydration {
            relations: params.with_relations,
            count: params.with_count,
        };
        self.run_query(&q, &conds.join(" AND "), &order, window, hydration).await
    }

    pub async fn search(&self, params: SearchParams) -> Result<Paginated<Value>, EngineError> {
        self.run_search(params, false).await
    }

    pub async fn search_with_deleted(&self, params: SearchParams) -> Result<Paginated<Value>, EngineError> {
        self.run_search(params, true).await
    }

    async fn run_search(&self, params: SearchParams, with_deleted: bool) -> Result<Paginated<Value>, EngineError> {
        let window = PageWindow::new(params.page, params.limit)?;
        let mut q = QueryBuf::new();
        let mut conds = vec![build_where(params.filter.as_ref(), &self.table, &mut q)?];
        if !with_deleted {
            conds.extend(self.live_condition());
        }
        let fields = if params.search_fields.is_empty() {
            &self.table.search_fields
        } else {
            &params.search_fields
        };
        let mut rank = None;
        if let Some(clause) = build_search(&params.search_query, fields, &params.priority_fields, &self.table, &mut q) {
            conds.push(clause.predicate);
            rank = clause.rank;
        }
        let order = self.order_clauses(&params.order_by, rank, params.priority_first);
        let hydration = Hydration {
            relations: params.with_relations,
            count: params.with_count,
        };
        self.run_query(&q, &conds.join(" AND "), &order, window, hydration).await
    }

    fn live_condition(&self) -> Option<String> {
        self.table
            .deleted_at
            .as_deref()
            .map(|d| format!("{} IS NULL", column_ref(d)))
    }

    /// Caller ordering (or the default: sort key, nulls last), the search rank before or after it,
    /// and the id as final tiebreaker.
    fn order_clauses(&self, order_by: &[OrderBy], rank: Option<String>, priority_first: bool) -> Vec<String> {
        let mut order = build_order_by(order_by, &self.table);
        if order.is_empty() {
            if let Some(sort) = &self.table.sort_column {
                order.push(format!("{} COLLATE \"C\" ASC NULLS LAST", column_ref(sort)));
            }
        }
        if let Some(rank) = rank {
            if priority_first {
                order.insert(0, rank);
            } else {
                order.push(rank);
            }
        }
        order.push(format!("{} ASC", column_ref(&self.table.id_column)));
        order
    }

    /// Page and total over one predicate, run concurrently.
    async fn run_query(
        &self,
        q: &QueryBuf,
        predicate: &str,
        order: &[String],
        window: PageWindow,
        hydration: Hydration,
    ) -> Result<Paginated<Value>, EngineError> {
        let page = select_page(&self.table, q, predicate, order, window.limit, window.offset, hydration);
        let count = select_count(&self.table, q, predicate);
        let (results, total) = tokio::try_join!(
            rows::fetch_all(&self.pool, &page),
            rows::fetch_count(&self.pool, &count)
        )?;
        Ok(Paginated { results, total })
    }

    pub async fn update(&self, id: &Value, data: Value) -> Result<Option<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.update_in(&mut tx, id, data).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Set only the supplied columns (`null` clears) and replace supplied relation arrays.
    /// `updated_at` is stamped even when only relations change. `None` when the row does not exist.
    pub async fn update_in(&self, conn: &mut PgConnection, id: &Value, data: Value) -> Result<Option<Value>, EngineError> {
        let mut record = self.prepare(WriteOp::Update, data).await?;
        let writes = relations::split(&self.table, &mut record)?;
        let t = &self.table;
        let fixed = [Some(&t.id_column), t.created_at.as_ref(), t.updated_at.as_ref()];
        let changes_columns = record
            .keys()
            .any(|k| t.has_column(k) && !fixed.contains(&Some(k)));
        let q = if !changes_columns && !writes.is_empty() {
            touch(&self.table, id)
        } else {
            update(&self.table, id, &record)
        };
        let Some(mut row) = rows::fetch_optional(&mut *conn, &q).await? else {
            return Ok(None);
        };
        let row_id = row.get(&self.table.id_column).cloned().unwrap_or_else(|| id.clone());
        relations::sync(conn, &self.table, &row_id, &writes).await?;
        relations::merge(&mut row, writes);
        Ok(Some(row))
    }

    pub async fn remove(&self, id: &Value) -> Result<Option<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.remove_in(&mut tx, id).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Soft delete when the table has a soft-delete column, otherwise physical delete.
    /// `None` when there is no live row.
    pub async fn remove_in(&self, conn: &mut PgConnection, id: &Value) -> Result<Option<Value>, EngineError> {
        match self.table.deleted_at.as_deref() {
            Some(d) => rows::fetch_optional(&mut *conn, &soft_delete(&self.table, d, id)).await,
            None => self.hard_delete_in(conn, id).await,
        }
    }

    pub async fn restore(&self, id: &Value) -> Result<Option<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.restore_in(&mut tx, id).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    pub async fn restore_in(&self, conn: &mut PgConnection, id: &Value) -> Result<Option<Value>, EngineError> {
        let d = self.require_deleted_at()?;
        rows::fetch_optional(&mut *conn, &restore(&self.table, d, id)).await
    }

    pub async fn hard_delete(&self, id: &Value) -> Result<Option<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.hard_delete_in(&mut tx, id).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Physical delete, junction rows first. A row still referenced elsewhere fails with a
    /// referential constraint error.
    pub async fn hard_delete_in(&self, conn: &mut PgConnection, id: &Value) -> Result<Option<Value>, EngineError> {
        for j in &self.table.junctions {
            rows::execute(&mut *conn, &delete_junction_rows(&self.table, j, id)).await?;
        }
        rows::fetch_optional(&mut *conn, &delete(&self.table, id)).await
    }

    pub async fn bulk_delete_by_ids(&self, ids: &[Value]) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;
        let n = self.bulk_delete_by_ids_in(&mut tx, ids).await?;
        tx.commit().await.map_err(translate)?;
        Ok(n)
    }

    /// `remove` for many ids. Returns the number of rows affected.
    pub async fn bulk_delete_by_ids_in(&self, conn: &mut PgConnection, ids: &[Value]) -> Result<u64, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut q = QueryBuf::new();
        let predicate = id_in(&self.table, &mut q, ids);
        self.delete_matching(conn, &q, &predicate, false).await
    }

    pub async fn bulk_hard_delete_by_ids(&self, ids: &[Value]) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;
        let n = self.bulk_hard_delete_by_ids_in(&mut tx, ids).await?;
        tx.commit().await.map_err(translate)?;
        Ok(n)
    }

    /// Physical delete of many ids; all or nothing.
    pub async fn bulk_hard_delete_by_ids_in(&self, conn: &mut PgConnection, ids: &[Value]) -> Result<u64, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut q = QueryBuf::new();
        let predicate = id_in(&self.table, &mut q, ids);
        self.delete_matching(conn, &q, &predicate, true).await
    }

    pub async fn bulk_delete_by_query(&self, filter: &FilterExpr) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;
        let n = self.bulk_delete_by_query_in(&mut tx, filter).await?;
        tx.commit().await.map_err(translate)?;
        Ok(n)
    }

    /// `remove` for every row matching the filter. A filter that matches everything is rejected.
    pub async fn bulk_delete_by_query_in(&self, conn: &mut PgConnection, filter: &FilterExpr) -> Result<u64, EngineError> {
        let mut q = QueryBuf::new();
        let predicate = build_where(Some(filter), &self.table, &mut q)?;
        if filter.matches_everything() {
            return Err(EngineError::validation("filter", "bulk delete requires a non-empty filter"));
        }
        self.delete_matching(conn, &q, &predicate, false).await
    }

    async fn delete_matching(
        &self,
        conn: &mut PgConnection,
        q: &QueryBuf,
        predicate: &str,
        hard: bool,
    ) -> Result<u64, EngineError> {
        let soft = if hard { None } else { self.table.deleted_at.as_deref() };
        if soft.is_none() {
            for j in &self.table.junctions {
                let jq = delete_junction_rows_where(&self.table, j, q, predicate);
                rows::execute(&mut *conn, &jq).await?;
            }
        }
        let n = rows::execute(&mut *conn, &delete_where(&self.table, q, predicate, soft)).await?;
        tracing::debug!(table = %self.table.table_name, affected = n, hard = soft.is_none(), "bulk delete");
        Ok(n)
    }

    pub async fn upsert(&self, data: Value, opts: &UpsertOptions) -> Result<Value, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.upsert_in(&mut tx, data, opts).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Insert, or update the row holding the same conflict-target values. The id, `created_at`,
    /// and `exclude_from_update` columns keep their stored values on update. Relation arrays are
    /// written afterwards in the same transaction.
    pub async fn upsert_in(&self, conn: &mut PgConnection, data: Value, opts: &UpsertOptions) -> Result<Value, EngineError> {
        let target = self.conflict_target(&opts.conflict_target)?;
        let mut record = self.prepare(WriteOp::Upsert, data).await?;
        let writes = relations::split(&self.table, &mut record)?;
        self.assign_id(&mut record);
        let mut exclude = opts.exclude_from_update.clone();
        if let Some(sort) = self.table.sort_column.as_deref() {
            if is_missing(&record, sort) {
                let last = self.neighbour_key(conn, sort, Neighbour::Last, None).await?;
                record.insert(sort.to_string(), Value::String(random_key_between(last.as_deref(), None)?));
                // an existing row keeps its position
                exclude.push(sort.to_string());
            }
        }
        let conflict = ConflictSpec {
            target: &target,
            exclude_from_update: &exclude,
            skip_duplicates: false,
        };
        let q = upsert_rows(&self.table, std::slice::from_ref(&record), &conflict);
        let mut row = rows::fetch_one(&mut *conn, &q).await?;
        let id = row.get(&self.table.id_column).cloned().unwrap_or(Value::Null);
        relations::sync(conn, &self.table, &id, &writes).await?;
        relations::merge(&mut row, writes);
        Ok(row)
    }

    pub async fn bulk_upsert(&self, records: Vec<Value>, opts: &BulkUpsertOptions) -> Result<Vec<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let rows = self.bulk_upsert_in(&mut tx, records, opts).await?;
        tx.commit().await.map_err(translate)?;
        Ok(rows)
    }

    /// Upsert many records with one conflict clause per statement.
    ///
    /// Records sharing conflict-target values are merged before the statement, later records
    /// overwriting the columns they supply (last write wins); with `skip_duplicates` the first
    /// record is kept and existing rows are left untouched. A column missing from one record but
    /// present in another is written as DEFAULT for that record. Relation fields are dropped
    /// with a warning. Records without a sort key are appended after the current last key and
    /// keep their stored position when they turn out to exist. Large batches are split to stay
    /// under the bind parameter limit; all chunks share the transaction.
    pub async fn bulk_upsert_in(
        &self,
        conn: &mut PgConnection,
        records: Vec<Value>,
        opts: &BulkUpsertOptions,
    ) -> Result<Vec<Value>, EngineError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let target = self.conflict_target(&opts.conflict_target)?;

        let mut batch: Vec<Record> = Vec::with_capacity(records.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut dropped: Vec<String> = Vec::new();
        for data in records {
            let mut record = self.prepare(WriteOp::Upsert, data).await?;
            for field in relations::strip(&self.table, &mut record) {
                if !dropped.contains(&field) {
                    dropped.push(field);
                }
            }
            match conflict_key(&record, &target) {
                Some(key) => match positions.get(&key) {
                    Some(_) if opts.skip_duplicates => {}
                    Some(&i) => batch[i].extend(record),
                    None => {
                        positions.insert(key, batch.len());
                        batch.push(record);
                    }
                },
                None => batch.push(record),
            }
        }
        for field in &dropped {
            tracing::warn!(table = %self.table.table_name, field = %field, "relation field ignored by bulk upsert");
        }
        for record in &mut batch {
            self.assign_id(record);
        }

        let mut groups: Vec<(Vec<Record>, Vec<String>)> = Vec::new();
        match self.table.sort_column.clone() {
            Some(sort) => {
                let (explicit, mut generated): (Vec<Record>, Vec<Record>) =
                    batch.into_iter().partition(|r| !is_missing(r, &sort));
                if !generated.is_empty() {
                    let stored = self.neighbour_key(conn, &sort, Neighbour::Last, None).await?;
                    let supplied = explicit
                        .iter()
                        .filter_map(|r| r.get(&sort).and_then(Value::as_str))
                        .max()
                        .map(str::to_string);
                    let mut last = stored.max(supplied);
                    for r in &mut generated {
                        let key = random_key_between(last.as_deref(), None)?;
                        r.insert(sort.clone(), Value::String(key.clone()));
                        last = Some(key);
                    }
                }
                let mut keep_position = opts.exclude_from_update.clone();
                keep_position.push(sort);
                groups.push((explicit, opts.exclude_from_update.clone()));
                groups.push((generated, keep_position));
            }
            None => groups.push((batch, opts.exclude_from_update.clone())),
        }

        let mut out = Vec::new();
        for (records, exclude) in groups {
            if records.is_empty() {
                continue;
            }
            let width = self
                .table
                .columns
                .iter()
                .filter(|c| records.iter().any(|r| r.contains_key(&c.name)))
                .count()
                .max(1);
            let per_statement = (MAX_BIND_PARAMS / width).max(1);
            let conflict = ConflictSpec {
                target: &target,
                exclude_from_update: &exclude,
                skip_duplicates: opts.skip_duplicates,
            };
            for chunk in records.chunks(per_statement) {
                let q = upsert_rows(&self.table, chunk, &conflict);
                out.extend(rows::fetch_all(&mut *conn, &q).await?);
            }
        }
        tracing::debug!(table = %self.table.table_name, returned = out.len(), "bulk upsert");
        Ok(out)
    }

    pub async fn duplicate(&self, id: &Value) -> Result<Option<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.duplicate_in(&mut tx, id).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Copy a live row under a new id, `name` suffixed with " (Copy)", placed last.
    /// Relation arrays are not copied.
    pub async fn duplicate_in(&self, conn: &mut PgConnection, id: &Value) -> Result<Option<Value>, EngineError> {
        let q = select_by_id(&self.table, id, false, Hydration::default());
        let Some(Value::Object(mut source)) = rows::fetch_optional(&mut *conn, &q).await? else {
            return Ok(None);
        };
        for col in self.table.managed_columns() {
            source.remove(col);
        }
        if let Some(Value::String(name)) = source.get_mut("name") {
            name.push_str(" (Copy)");
        }
        self.create_in(conn, Value::Object(source)).await.map(Some)
    }

    pub async fn reorder(&self, id: &Value, after_item_id: Option<&Value>) -> Result<Option<Value>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = self.reorder_in(&mut tx, id, after_item_id).await?;
        tx.commit().await.map_err(translate)?;
        Ok(row)
    }

    /// Move a row directly after `after_item_id`, or to the front when it is `None`, missing,
    /// soft-deleted, or the row itself. An anchor without a sort key sends the row to the end.
    /// Only the moved row is written. `None` when the row does not exist.
    pub async fn reorder_in(
        &self,
        conn: &mut PgConnection,
        id: &Value,
        after_item_id: Option<&Value>,
    ) -> Result<Option<Value>, EngineError> {
        let sort = self.require_sort_column()?;
        if rows::fetch_optional(&mut *conn, &select_sort_key(&self.table, sort, id)).await?.is_none() {
            return Ok(None);
        }
        let key = match self.allocate_key(conn, sort, id, after_item_id).await {
            Err(EngineError::SortKeyExhausted { after, before }) => match &self.rebalancer {
                Some(rebalancer) => {
                    tracing::info!(table = %self.table.table_name, ?after, ?before, "sort keys exhausted, rebalancing");
                    rebalancer.rebalance(conn, &self.table).await?;
                    self.allocate_key(conn, sort, id, after_item_id).await?
                }
                None => return Err(EngineError::SortKeyExhausted { after, before }),
            },
            other => other?,
        };
        let row = rows::fetch_optional(&mut *conn, &set_sort_key(&self.table, sort, id, &key)).await?;
        if self.table.junctions.is_empty() || row.is_none() {
            return Ok(row);
        }
        let hydration = Hydration {
            relations: true,
            count: false,
        };
        rows::fetch_optional(&mut *conn, &select_by_id(&self.table, id, true, hydration)).await
    }

    async fn allocate_key(
        &self,
        conn: &mut PgConnection,
        sort: &str,
        id: &Value,
        after_item_id: Option<&Value>,
    ) -> Result<String, EngineError> {
        let anchor = match after_item_id {
            Some(after) if after != id => {
                rows::fetch_optional(&mut *conn, &select_sort_key(&self.table, sort, after)).await?
            }
            _ => None,
        };
        let (lower, upper) = match anchor {
            None => (None, self.neighbour_key(conn, sort, Neighbour::First, Some(id)).await?),
            Some(row) => match row.get(sort).and_then(Value::as_str) {
                Some(k) => {
                    let upper = self.neighbour_key(conn, sort, Neighbour::After(k), Some(id)).await?;
                    (Some(k.to_string()), upper)
                }
                None => (self.neighbour_key(conn, sort, Neighbour::Last, Some(id)).await?, None),
            },
        };
        Ok(random_key_between(lower.as_deref(), upper.as_deref())?)
    }

    /// Raw parameterized statement; rows come back as JSON objects.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, EngineError> {
        let q = QueryBuf {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        rows::fetch_all(&self.pool, &q).await
    }

    /// Tables `truncate_all` clears: every junction table, then the entity table.
    pub fn truncate_affected_tables(&self) -> Vec<String> {
        truncate_tables(&self.table)
    }

    pub async fn truncate_all(&self) -> Result<(), EngineError> {
        let tables = self.truncate_affected_tables();
        tracing::info!(tables = ?tables, "truncate");
        rows::execute(&self.pool, &truncate(&tables)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn conflict_keys_ignore_missing_and_null() {
        let target = vec!["code".to_string(), "region".to_string()];
        let a = conflict_key(&record(json!({ "code": "R", "region": 1, "name": "x" })), &target);
        let b = conflict_key(&record(json!({ "region": 1, "code": "R" })), &target);
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(conflict_key(&record(json!({ "code": "R" })), &target), None);
        assert_eq!(conflict_key(&record(json!({ "code": "R", "region": null })), &target), None);
        assert_ne!(
            conflict_key(&record(json!({ "code": "1", "region": 1 })), &target),
            conflict_key(&record(json!({ "code": 1, "region": 1 })), &target)
        );
    }

    #[test]
    fn payload_must_be_an_object() {
        assert!(into_record(json!({ "a": 1 })).is_ok());
        assert!(matches!(into_record(json!([1])), Err(EngineError::Validation { field: None, .. })));
    }
}
