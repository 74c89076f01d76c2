pub mod database;
pub mod query;

pub use database::{Database, DatabaseConfig, tenant_filter};
pub use query::{FindOptions, Page, PageMeta, Pagination, PaginationMeta, Sort, UpdateOutcome};
