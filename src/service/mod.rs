//! EntityService: config-driven CRUD, search, relation sync, and ordering for one table.

mod crud;
mod params;
mod relations;
mod rows;
mod validation;
pub use crud::EntityService;
pub use params::{
    BulkUpsertOptions, ListParams, Paginated, ReadOptions, Record, SearchParams, UpsertOptions, DEFAULT_LIMIT,
    MAX_LIMIT,
};
pub use validation::{PayloadValidator, RuleValidator, WriteOp};
