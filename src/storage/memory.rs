//! In-process document store.
//!
//! `MemoryStore` behaves like a small document server: it hands out
//! connections through [`Connector`], keeps one lock per collection, and
//! records connection and call statistics. Failures can be queued per
//! operation so callers can exercise their retry and degradation paths.

use super::engine::{Connector, FindQuery, StoreConnection, UpdateResult};
use super::filter::{matches, project, sort_documents};
use super::pipeline;
use crate::connection::config::ConnectionConfig;
use crate::core::{Document, ID_FIELD, ObjectId, StoreError, StoreResult, values_equal};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;

/// Store operations, used to target injected failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    Count,
    Find,
    FindOne,
    InsertOne,
    UpdateOne,
    DeleteOne,
    DeleteMany,
    Aggregate,
}

/// Snapshot of a store's connection and call counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub calls: HashMap<StoreOp, u64>,
    /// Documents removed by each successful `delete_many` call, in order
    pub delete_many_batches: Vec<u64>,
}

impl MemoryStoreStats {
    pub fn open_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }

    pub fn calls(&self, op: StoreOp) -> u64 {
        self.calls.get(&op).copied().unwrap_or(0)
    }
}

type CollectionHandle = Arc<RwLock<Vec<Document>>>;

struct MemoryState {
    /// Collections keyed by `database.collection`
    collections: RwLock<HashMap<String, CollectionHandle>>,
    credentials: Option<(String, String)>,
    reachable: AtomicBool,
    failures: Mutex<VecDeque<(StoreOp, StoreError)>>,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    calls: Mutex<HashMap<StoreOp, u64>>,
    delete_many_batches: Mutex<Vec<u64>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Counters stay usable even if a panicking test poisoned them
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle to an in-process document server.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A store that only accepts connections carrying these credentials.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self::build(Some((username.to_string(), password.to_string())))
    }

    fn build(credentials: Option<(String, String)>) -> Self {
        Self {
            state: Arc::new(MemoryState {
                collections: RwLock::new(HashMap::new()),
                credentials,
                reachable: AtomicBool::new(true),
                failures: Mutex::new(VecDeque::new()),
                connections_opened: AtomicU64::new(0),
                connections_closed: AtomicU64::new(0),
                calls: Mutex::new(HashMap::new()),
                delete_many_batches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn inject_failures(&self, op: StoreOp, error: StoreError, times: usize) {
        let mut failures = locked(&self.state.failures);
        for _ in 0..times {
            failures.push_back((op, error.clone()));
        }
    }

    pub fn inject_failure(&self, op: StoreOp, error: StoreError) {
        self.inject_failures(op, error, 1);
    }

    /// Simulate the server going away; new connections are refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            connections_opened: self.state.connections_opened.load(Ordering::SeqCst),
            connections_closed: self.state.connections_closed.load(Ordering::SeqCst),
            calls: locked(&self.state.calls).clone(),
            delete_many_batches: locked(&self.state.delete_many_batches).clone(),
        }
    }

    /// Number of documents currently held in `database.collection`.
    pub async fn len(&self, database: &str, collection: &str) -> usize {
        let key = collection_key(database, collection);
        let handle = self.state.collections.read().await.get(&key).cloned();
        match handle {
            Some(handle) => handle.read().await.len(),
            None => 0,
        }
    }

    fn begin(&self, op: StoreOp) -> StoreResult<()> {
        *locked(&self.state.calls).entry(op).or_insert(0) += 1;

        let mut failures = locked(&self.state.failures);
        if let Some(position) = failures.iter().position(|(target, _)| *target == op) {
            if let Some((_, error)) = failures.remove(position) {
                debug!("memory store: injected failure for {:?}: {}", op, error);
                return Err(error);
            }
        }
        Ok(())
    }

    async fn collection(&self, database: &str, collection: &str) -> CollectionHandle {
        let key = collection_key(database, collection);

        if let Some(handle) = self.state.collections.read().await.get(&key) {
            return Arc::clone(handle);
        }

        let mut collections = self.state.collections.write().await;
        Arc::clone(collections.entry(key).or_default())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn collection_key(database: &str, collection: &str) -> String {
    format!("{}.{}", database, collection)
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn StoreConnection>> {
        self.begin(StoreOp::Connect)?;

        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed(format!(
                "{} is unreachable",
                config.redacted_url()
            )));
        }

        if let Some((username, password)) = &self.state.credentials {
            let supplied = (config.username.as_deref(), config.password.as_deref());
            if supplied != (Some(username.as_str()), Some(password.as_str())) {
                return Err(StoreError::ConnectionFailed("authentication failed".to_string()));
            }
        }

        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            store: self.clone(),
            database: config.database.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection to a [`MemoryStore`] bound to one database.
pub struct MemoryConnection {
    store: MemoryStore,
    database: String,
    closed: AtomicBool,
}

impl MemoryConnection {
    async fn open(&self, op: StoreOp, collection: &str) -> StoreResult<CollectionHandle> {
        if self.is_closed() {
            return Err(StoreError::ConnectionClosed);
        }
        self.store.begin(op)?;
        Ok(self.store.collection(&self.database, collection).await)
    }
}

/// Assign `value` at a dotted path, creating intermediate objects.
/// Returns whether the stored value changed.
fn set_path(document: &mut Document, path: &str, value: &Value) -> StoreResult<bool> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    match rest {
        None => {
            let changed = document
                .get(head)
                .is_none_or(|current| !values_equal(current, value));
            if changed {
                document.insert(head.to_string(), value.clone());
            }
            Ok(changed)
        }
        Some(rest) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            match child {
                Value::Object(nested) => set_path(nested, rest, value),
                _ => Err(StoreError::InvalidQuery(format!(
                    "cannot create field '{}' inside a non-object value",
                    path
                ))),
            }
        }
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        let handle = self.open(StoreOp::Count, collection).await?;
        let documents = handle.read().await;

        let mut total = 0;
        for document in documents.iter() {
            if matches(document, filter)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>> {
        let handle = self.open(StoreOp::Find, collection).await?;

        let mut found = Vec::new();
        {
            let documents = handle.read().await;
            for document in documents.iter() {
                if matches(document, &query.filter)? {
                    found.push(document.clone());
                }
            }
        }

        if let Some((field, order)) = &query.sort {
            sort_documents(&mut found, field, *order);
        }

        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(found
            .into_iter()
            .skip(query.skip as usize)
            .take(limit)
            .map(|document| project(document, &query.projection))
            .collect())
    }

    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>> {
        let handle = self.open(StoreOp::FindOne, collection).await?;
        let documents = handle.read().await;

        for document in documents.iter() {
            if matches(document, filter)? {
                return Ok(Some(document.clone()));
            }
        }
        Ok(None)
    }

    async fn insert_one(&self, collection: &str, mut document: Document) -> StoreResult<String> {
        let handle = self.open(StoreOp::InsertOne, collection).await?;
        let mut documents = handle.write().await;

        let id = match document.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::String(_)) | None => ObjectId::new().to_hex(),
            Some(other) => {
                return Err(StoreError::InvalidQuery(format!(
                    "'_id' must be a string, got {}",
                    other
                )));
            }
        };

        if documents
            .iter()
            .any(|existing| existing.get(ID_FIELD).and_then(Value::as_str) == Some(id.as_str()))
        {
            return Err(StoreError::Backend(format!(
                "duplicate key error collection: {} _id: {}",
                collection, id
            )));
        }

        document.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        documents.push(document);

        Ok(id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        set: &Document,
    ) -> StoreResult<UpdateResult> {
        let handle = self.open(StoreOp::UpdateOne, collection).await?;
        let mut documents = handle.write().await;

        let mut target = None;
        for (index, document) in documents.iter().enumerate() {
            if matches(document, filter)? {
                target = Some(index);
                break;
            }
        }

        let Some(index) = target else {
            return Ok(UpdateResult::default());
        };

        if let Some(new_id) = set.get(ID_FIELD) {
            if documents[index].get(ID_FIELD) != Some(new_id) {
                return Err(StoreError::InvalidQuery(
                    "updating the path '_id' would modify an immutable field".to_string(),
                ));
            }
        }

        // Apply to a copy so a failing path leaves the stored document untouched
        let mut updated = documents[index].clone();
        let mut modified = false;
        for (path, value) in set {
            modified |= set_path(&mut updated, path, value)?;
        }

        if modified {
            documents[index] = updated;
        }

        Ok(UpdateResult {
            matched_count: 1,
            modified_count: u64::from(modified),
        })
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        let handle = self.open(StoreOp::DeleteOne, collection).await?;
        let mut documents = handle.write().await;

        for index in 0..documents.len() {
            if matches(&documents[index], filter)? {
                documents.remove(index);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        let handle = self.open(StoreOp::DeleteMany, collection).await?;
        let mut documents = handle.write().await;

        // Evaluate every document first so an invalid filter deletes nothing
        let mut doomed = Vec::with_capacity(documents.len());
        for document in documents.iter() {
            doomed.push(matches(document, filter)?);
        }

        let deleted = doomed.iter().filter(|d| **d).count() as u64;
        let mut flags = doomed.into_iter();
        documents.retain(|_| !flags.next().unwrap_or(false));

        locked(&self.store.state.delete_many_batches).push(deleted);
        Ok(deleted)
    }

    async fn aggregate(&self, collection: &str, stages: &[Document]) -> StoreResult<Vec<Document>> {
        let handle = self.open(StoreOp::Aggregate, collection).await?;
        let documents = handle.read().await.clone();

        pipeline::run(documents, stages)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store
                .state
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}
