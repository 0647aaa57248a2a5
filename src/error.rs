//! Typed errors, storage constraint translation, and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Programming errors: bad table/relation config or an operation the table is not configured for.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("unknown column '{column}' on table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("duplicate relation field: {0}")]
    DuplicateField(String),
    #[error("relation field '{0}' collides with a column")]
    FieldCollision(String),
    #[error("table {table} has no {what} column")]
    MissingColumn { table: String, what: &'static str },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which storage constraint a write tripped over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Delete of a row still referenced by a foreign key.
    Referential,
    /// A cascading clear hit a NOT NULL foreign key column.
    RequiredRelation,
    /// Unique index or primary key already holds the value.
    UniqueConflict,
}

impl ConstraintKind {
    /// Classify a PostgreSQL SQLSTATE. Codes outside the three handled classes return None.
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            "23503" => Some(ConstraintKind::Referential),
            "23502" => Some(ConstraintKind::RequiredRelation),
            "23505" => Some(ConstraintKind::UniqueConflict),
            _ => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ConstraintKind::Referential => "referenced by other records",
            ConstraintKind::RequiredRelation => "target of a required relation",
            ConstraintKind::UniqueConflict => "value already in use",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    pub constraint: Option<String>,
    pub table: Option<String>,
}

impl std::fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind.message())?;
        if let Some(c) = &self.constraint {
            write!(f, " ({})", c)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("validation: {message}")]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error("constraint: {0}")]
    Constraint(ConstraintViolation),
    #[error("sort key space exhausted between {after:?} and {before:?}")]
    SortKeyExhausted {
        after: Option<String>,
        before: Option<String>,
    },
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// The constraint category, if this error came from a translated storage violation.
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self {
            EngineError::Constraint(v) => Some(v.kind),
            _ => None,
        }
    }
}

/// Map a storage error onto the constraint taxonomy; anything unrecognized passes through as `Db`.
pub fn translate(err: sqlx::Error) -> EngineError {
    let kind = match &err {
        sqlx::Error::Database(db) => db.code().and_then(|c| ConstraintKind::from_sqlstate(&c)),
        _ => None,
    };
    match (kind, &err) {
        (Some(kind), sqlx::Error::Database(db)) => {
            let violation = ConstraintViolation {
                kind,
                constraint: db.constraint().map(str::to_string),
                table: db.table().map(str::to_string),
            };
            tracing::debug!(kind = ?kind, constraint = ?violation.constraint, "constraint violation");
            EngineError::Constraint(violation)
        }
        _ => EngineError::Db(err),
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            EngineError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            EngineError::Validation { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            EngineError::Constraint(v) => (
                StatusCode::CONFLICT,
                match v.kind {
                    ConstraintKind::Referential => "referenced",
                    ConstraintKind::RequiredRelation => "required_relation",
                    ConstraintKind::UniqueConflict => "unique_conflict",
                },
            ),
            EngineError::SortKeyExhausted { .. } => (StatusCode::CONFLICT, "sort_key_exhausted"),
            EngineError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        };
        let details = match &self {
            EngineError::Validation { field: Some(f), .. } => Some(serde_json::json!({ "field": f })),
            EngineError::Constraint(v) => Some(serde_json::json!({
                "constraint": v.constraint,
                "table": v.table,
            })),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        assert_eq!(ConstraintKind::from_sqlstate("23503"), Some(ConstraintKind::Referential));
        assert_eq!(ConstraintKind::from_sqlstate("23502"), Some(ConstraintKind::RequiredRelation));
        assert_eq!(ConstraintKind::from_sqlstate("23505"), Some(ConstraintKind::UniqueConflict));
        assert_eq!(ConstraintKind::from_sqlstate("23514"), None);
        assert_eq!(ConstraintKind::from_sqlstate("42P01"), None);
    }

    #[test]
    fn non_database_errors_pass_through() {
        let err = translate(sqlx::Error::RowNotFound);
        assert!(matches!(err, EngineError::Db(sqlx::Error::RowNotFound)));
        assert_eq!(err.constraint_kind(), None);
    }

    #[test]
    fn violation_display_names_constraint() {
        let v = ConstraintViolation {
            kind: ConstraintKind::UniqueConflict,
            constraint: Some("tags_name_key".into()),
            table: Some("tags".into()),
        };
        assert_eq!(v.to_string(), "value already in use (tags_name_key)");
    }

    #[test]
    fn status_codes() {
        let conflict = EngineError::Constraint(ConstraintViolation {
            kind: ConstraintKind::Referential,
            constraint: None,
            table: None,
        });
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);
        let invalid = EngineError::validation("name", "name is required");
        assert_eq!(invalid.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
        let cfg = EngineError::from(ConfigError::Invalid("x".into()));
        assert_eq!(cfg.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
