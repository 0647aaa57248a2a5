//! Filter trees, ordering lists, and free-text search lowered to SQL fragments over the `main` alias.

use crate::config::ResolvedTable;
use crate::error::EngineError;
use crate::sql::builder::{column_ref, QueryBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

/// Leaf conditions combined with and/or nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterExpr {
    Condition {
        field: String,
        operator: Operator,
        #[serde(default)]
        value: Value,
    },
    And { conditions: Vec<FilterExpr> },
    Or { conditions: Vec<FilterExpr> },
}

impl FilterExpr {
    pub fn condition(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        FilterExpr::Condition {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::condition(field, Operator::Eq, value)
    }

    pub fn and(conditions: Vec<FilterExpr>) -> Self {
        FilterExpr::And { conditions }
    }

    pub fn or(conditions: Vec<FilterExpr>) -> Self {
        FilterExpr::Or { conditions }
    }

    /// True when the tree lowers to a predicate that holds for every row, however it is nested.
    pub fn matches_everything(&self) -> bool {
        match self {
            FilterExpr::And { conditions } => conditions.iter().all(FilterExpr::matches_everything),
            FilterExpr::Or { conditions } => conditions.iter().any(FilterExpr::matches_everything),
            FilterExpr::Condition { operator, value, .. } => {
                *operator == Operator::NotIn && value.as_array().is_some_and(|a| a.is_empty())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Escape LIKE metacharacters so user text matches literally.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn value_as_text(field: &str, v: &Value) -> Result<String, EngineError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(EngineError::validation(field, format!("{} requires a scalar value", field))),
    }
}

/// Lower a filter tree to one predicate. `None` and `and[]` are TRUE; `or[]` is FALSE.
pub fn build_where(
    expr: Option<&FilterExpr>,
    table: &ResolvedTable,
    q: &mut QueryBuf,
) -> Result<String, EngineError> {
    match expr {
        None => Ok("TRUE".into()),
        Some(e) => lower(e, table, q),
    }
}

fn lower(expr: &FilterExpr, table: &ResolvedTable, q: &mut QueryBuf) -> Result<String, EngineError> {
    match expr {
        FilterExpr::And { conditions } => {
            if conditions.is_empty() {
                return Ok("TRUE".into());
            }
            let parts = conditions
                .iter()
                .map(|c| lower(c, table, q))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        FilterExpr::Or { conditions } => {
            if conditions.is_empty() {
                return Ok("FALSE".into());
            }
            let parts = conditions
                .iter()
                .map(|c| lower(c, table, q))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        FilterExpr::Condition { field, operator, value } => lower_condition(field, *operator, value, table, q),
    }
}

fn lower_condition(
    field: &str,
    op: Operator,
    value: &Value,
    table: &ResolvedTable,
    q: &mut QueryBuf,
) -> Result<String, EngineError> {
    let col = table
        .column(field)
        .ok_or_else(|| EngineError::validation(field, format!("unknown filter field: {}", field)))?;
    let lhs = column_ref(&col.name);
    let pg_type = col.pg_type.as_deref();
    let compare = |q: &mut QueryBuf, sym: &str| format!("{} {} {}", lhs, sym, q.placeholder(value.clone(), pg_type));
    let pattern = |q: &mut QueryBuf, sym: &str, pat: String| {
        format!("{}::text {} {}", lhs, sym, q.placeholder(Value::String(pat), None))
    };
    Ok(match op {
        Operator::Eq if value.is_null() => format!("{} IS NULL", lhs),
        Operator::Ne if value.is_null() => format!("{} IS NOT NULL", lhs),
        Operator::Eq => compare(q, "="),
        Operator::Ne => compare(q, "<>"),
        Operator::Gt => compare(q, ">"),
        Operator::Gte => compare(q, ">="),
        Operator::Lt => compare(q, "<"),
        Operator::Lte => compare(q, "<="),
        Operator::Like => pattern(q, "LIKE", value_as_text(field, value)?),
        Operator::Ilike => pattern(q, "ILIKE", value_as_text(field, value)?),
        Operator::Contains => pattern(q, "ILIKE", format!("%{}%", escape_like(&value_as_text(field, value)?))),
        Operator::StartsWith => pattern(q, "ILIKE", format!("{}%", escape_like(&value_as_text(field, value)?))),
        Operator::EndsWith => pattern(q, "ILIKE", format!("%{}", escape_like(&value_as_text(field, value)?))),
        Operator::In | Operator::NotIn => {
            let items = value
                .as_array()
                .ok_or_else(|| EngineError::validation(field, format!("{} requires an array value", field)))?;
            let negate = op == Operator::NotIn;
            if items.is_empty() {
                return Ok(if negate { "TRUE" } else { "FALSE" }.into());
            }
            let phs: Vec<String> = items.iter().map(|v| q.placeholder(v.clone(), pg_type)).collect();
            format!("{} {}IN ({})", lhs, if negate { "NOT " } else { "" }, phs.join(", "))
        }
        Operator::IsNull => format!("{} IS NULL", lhs),
        Operator::IsNotNull => format!("{} IS NOT NULL", lhs),
    })
}

/// Sort clauses in the given order; unknown fields are skipped. The sort-key column compares byte-wise.
pub fn build_order_by(order: &[OrderBy], table: &ResolvedTable) -> Vec<String> {
    order
        .iter()
        .filter(|o| table.has_column(&o.field))
        .map(|o| {
            let dir = match o.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            if table.sort_column.as_deref() == Some(o.field.as_str()) {
                format!("{} COLLATE \"C\" {}", column_ref(&o.field), dir)
            } else {
                format!("{} {}", column_ref(&o.field), dir)
            }
        })
        .collect()
}

/// Free-text search lowered against one shared pattern parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchClause {
    /// OR of case-insensitive partial matches; AND this onto the base predicate.
    pub predicate: String,
    /// 0 for rows matching a priority field, 1 otherwise.
    pub rank: Option<String>,
}

pub fn build_search(
    query: &str,
    fields: &[String],
    priority_fields: &[String],
    table: &ResolvedTable,
    q: &mut QueryBuf,
) -> Option<SearchClause> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    let fields: Vec<&String> = fields.iter().filter(|f| table.has_column(f)).collect();
    if fields.is_empty() {
        tracing::debug!(table = %table.table_name, query = %query, "search without searchable fields matches nothing");
        return Some(SearchClause {
            predicate: "FALSE".into(),
            rank: None,
        });
    }
    let n = q.push_param(Value::String(format!("%{}%", escape_like(query))));
    let matcher = |f: &str| format!("{}::text ILIKE ${}", column_ref(f), n);
    let predicate = format!(
        "({})",
        fields.iter().map(|f| matcher(f)).collect::<Vec<_>>().join(" OR ")
    );
    let priority: Vec<String> = priority_fields
        .iter()
        .filter(|f| table.has_column(f))
        .map(|f| matcher(f))
        .collect();
    let rank = if priority.is_empty() {
        None
    } else {
        Some(format!("CASE WHEN {} THEN 0 ELSE 1 END", priority.join(" OR ")))
    };
    Some(SearchClause { predicate, rank })
}
