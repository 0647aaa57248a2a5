//! Call options and result shapes for EntityService operations.

use crate::error::EngineError;
use crate::sql::{FilterExpr, Hydration, OrderBy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A write payload keyed by column or relation field.
pub type Record = HashMap<String, Value>;

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 1000;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadOptions {
    pub with_relations: bool,
    pub with_count: bool,
}

impl ReadOptions {
    pub fn hydration(&self) -> Hydration {
        Hydration {
            relations: self.with_relations,
            count: self.with_count,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub filter: Option<FilterExpr>,
    pub order_by: Vec<OrderBy>,
    /// 1-based; defaults to 1.
    pub page: Option<u32>,
    /// Defaults to 100; above 1000 is rejected.
    pub limit: Option<u32>,
    pub with_relations: bool,
    pub with_count: bool,
    pub with_deleted: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchParams {
    pub search_query: String,
    /// Overrides the table's default search fields when non-empty.
    pub search_fields: Vec<String>,
    pub priority_fields: Vec<String>,
    /// Rank priority matches ahead of the caller ordering instead of after it.
    pub priority_first: bool,
    pub filter: Option<FilterExpr>,
    pub order_by: Vec<OrderBy>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub with_relations: bool,
    pub with_count: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpsertOptions {
    /// Natural-key columns; the id column when empty.
    pub conflict_target: Vec<String>,
    pub exclude_from_update: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkUpsertOptions {
    pub conflict_target: Vec<String>,
    pub exclude_from_update: Vec<String>,
    /// Leave existing rows alone (`DO NOTHING`); in-batch duplicates keep the first record.
    pub skip_duplicates: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub results: Vec<T>,
    pub total: u64,
}

/// LIMIT/OFFSET pair derived from a 1-based page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PageWindow {
    pub limit: u32,
    pub offset: u64,
}

impl PageWindow {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Result<Self, EngineError> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        if page == 0 {
            return Err(EngineError::validation("page", "page must be at least 1"));
        }
        if limit == 0 {
            return Err(EngineError::validation("limit", "limit must be at least 1"));
        }
        if limit > MAX_LIMIT {
            return Err(EngineError::validation(
                "limit",
                format!("limit must be at most {}", MAX_LIMIT),
            ));
        }
        Ok(PageWindow {
            limit,
            offset: (page as u64 - 1) * limit as u64,
        })
    }
}
