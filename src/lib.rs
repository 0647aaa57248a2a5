//! Entity engine: configuration-driven data access for PostgreSQL tables.
//!
//! One [`EntityService`] per table gives create/read/update/delete, upserts, search with
//! pagination, many-to-many relation sync, soft delete, and fractional-key reordering.

pub mod config;
pub mod error;
pub mod ordering;
pub mod service;
pub mod sql;

pub use config::{resolve, ResolvedTable, TableConfig};
pub use error::{ConfigError, ConstraintKind, ConstraintViolation, EngineError};
pub use ordering::{key_between, random_key_between, SortKeyRebalancer};
pub use service::{
    BulkUpsertOptions, EntityService, ListParams, Paginated, PayloadValidator, ReadOptions, Record, RuleValidator,
    SearchParams, UpsertOptions, WriteOp,
};
pub use sql::{FilterExpr, Operator, OrderBy, SortDirection};
