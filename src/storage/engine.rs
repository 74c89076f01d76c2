use super::filter::SortOrder;
use crate::connection::config::ConnectionConfig;
use crate::core::{Document, StoreResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Read request for [`StoreConnection::find`].
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Document,
    /// Top level fields to return. Empty returns whole documents.
    pub projection: Vec<String>,
    pub sort: Option<(String, SortOrder)>,
    pub skip: u64,
    pub limit: Option<u64>,
}

/// Outcome of a single document `$set` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// An open connection to a document store - allows pluggable backends
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Count documents matching the filter
    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Filtered, sorted, sliced read
    async fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>>;

    /// First document matching the filter in natural order
    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>>;

    /// Insert a document and return its id, assigning one when `_id` is absent
    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<String>;

    /// Apply `$set` semantics to the first document matching the filter
    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        set: &Document,
    ) -> StoreResult<UpdateResult>;

    /// Remove the first document matching the filter
    async fn delete_one(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Remove every document matching the filter
    async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Run a multi-stage aggregation pipeline
    async fn aggregate(&self, collection: &str, pipeline: &[Document]) -> StoreResult<Vec<Document>>;

    /// Release the connection. Must be idempotent; called from `Drop`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens connections to a store described by a [`ConnectionConfig`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn StoreConnection>>;
}

/// Check a collection name before it reaches the store.
pub fn validate_collection_name(name: &str) -> Result<(), String> {
    let Some(first) = name.chars().next() else {
        return Err("Collection name cannot be empty".to_string());
    };

    // Must start with letter or underscore
    if !first.is_alphabetic() && first != '_' {
        return Err("Collection name must start with a letter or underscore".to_string());
    }

    // Can only contain alphanumeric and underscores
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(
            "Collection name can only contain letters, numbers, and underscores".to_string(),
        );
    }

    if name.len() > 64 {
        return Err("Collection name too long (max 64 characters)".to_string());
    }

    Ok(())
}
