pub mod config;

use crate::core::{Document, StoreError, StoreResult};
use crate::storage::{Connector, FindQuery, StoreConnection, UpdateResult};
use config::ConnectionConfig;
use log::debug;
use std::sync::Arc;

/// Opens one scoped connection per logical operation.
///
/// There is no pooling: every call to [`ConnectionManager::open`] asks the
/// connector for a fresh connection, and the returned guard releases it.
#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a connection, failing after `connect_timeout`
    pub async fn open(&self) -> StoreResult<ConnectionGuard> {
        debug!("opening connection to {}", self.config.redacted_url());

        let connect = self.connector.connect(&self.config);
        let connection = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                StoreError::ConnectionFailed(format!(
                    "timed out after {:?} connecting to {}",
                    self.config.connect_timeout,
                    self.config.redacted_url()
                ))
            })??;

        Ok(ConnectionGuard {
            connection: Some(connection),
        })
    }
}

/// RAII guard for an open connection
///
/// Closes the connection when dropped, so early returns, errors and
/// cancelled futures all release it.
pub struct ConnectionGuard {
    connection: Option<Arc<dyn StoreConnection>>,
}

impl ConnectionGuard {
    /// Handle to a named collection on this connection
    pub fn collection(&self, name: &str) -> StoreResult<Collection> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(StoreError::ConnectionClosed)?;

        Ok(Collection {
            name: name.to_string(),
            connection: Arc::clone(connection),
        })
    }

    pub fn is_open(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Explicitly close the connection
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.connection.is_some() {
            self.release();
        }
    }
}

/// A named collection on an open connection.
///
/// Cheap to clone. Outliving the guard is harmless: once the guard closes
/// the connection every call fails with [`StoreError::ConnectionClosed`].
#[derive(Clone)]
pub struct Collection {
    name: String,
    connection: Arc<dyn StoreConnection>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn count(&self, filter: &Document) -> StoreResult<u64> {
        self.connection.count(&self.name, filter).await
    }

    pub async fn find(&self, query: &FindQuery) -> StoreResult<Vec<Document>> {
        self.connection.find(&self.name, query).await
    }

    pub async fn find_one(&self, filter: &Document) -> StoreResult<Option<Document>> {
        self.connection.find_one(&self.name, filter).await
    }

    pub async fn insert_one(&self, document: Document) -> StoreResult<String> {
        self.connection.insert_one(&self.name, document).await
    }

    pub async fn update_one(&self, filter: &Document, set: &Document) -> StoreResult<UpdateResult> {
        self.connection.update_one(&self.name, filter, set).await
    }

    pub async fn delete_one(&self, filter: &Document) -> StoreResult<u64> {
        self.connection.delete_one(&self.name, filter).await
    }

    pub async fn delete_many(&self, filter: &Document) -> StoreResult<u64> {
        self.connection.delete_many(&self.name, filter).await
    }

    pub async fn aggregate(&self, pipeline: &[Document]) -> StoreResult<Vec<Document>> {
        self.connection.aggregate(&self.name, pipeline).await
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("open", &self.is_open())
            .finish()
    }
}
