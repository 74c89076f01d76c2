// ============================================================================
// covulor Library
// ============================================================================

//! Tenant-scoped data access for security findings and source repositories.
//!
//! Layers, from the caller down:
//!
//! - [`entity`]: `Finding` and `Repository` services with typed models
//! - [`facade`]: the generic [`Database`] operations, all scoped by [`ClientId`]
//! - [`resilience`]: retry of rate limited calls
//! - [`connection`]: one scoped connection per operation
//! - [`storage`]: the store boundary and the bundled [`MemoryStore`]
//!
//! # Examples
//!
//! ```
//! use covulor::{ClientId, Database, DatabaseConfig, FindOptions, MemoryStore};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! let db = Database::in_memory(&store, DatabaseConfig::default()).unwrap();
//!
//! let document = json!({"client_id": "acme", "status": "open"});
//! let id = db.insert_one("Finding", document.as_object().cloned().unwrap()).await;
//! assert!(!id.is_empty());
//!
//! let acme = ClientId::new("acme").unwrap();
//! let page = db.find_many("Finding", &acme, &FindOptions::default()).await;
//! assert_eq!(page.pagination().unwrap().total, 1);
//! # });
//! ```

pub mod collections;
pub mod connection;
pub mod core;
pub mod entity;
pub mod facade;
pub mod resilience;
pub mod storage;

pub use connection::config::ConnectionConfig;
pub use connection::{Collection, ConnectionGuard, ConnectionManager};
pub use crate::core::{ClientId, DatabaseError, Document, ObjectId, Result, StoreError, StoreResult};
pub use entity::{
    DedupScope, DeleteSummary, EntityError, EntityModel, EntityPatch, EntityResult, Finding,
    FindingModel, FindingPatch, NewRepository, Repository, RepositoryModel, RepositoryPatch,
};
pub use facade::{
    Database, DatabaseConfig, FindOptions, Page, Pagination, PaginationMeta, Sort, UpdateOutcome,
};
pub use resilience::{BatchPolicy, RetryPolicy};
pub use storage::{Connector, MemoryStore, SortOrder, StoreConnection, StoreOp};
