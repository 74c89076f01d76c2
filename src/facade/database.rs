use super::query::{FindOptions, Page, PageMeta, PaginationMeta, UpdateOutcome};
use crate::connection::config::ConnectionConfig;
use crate::connection::{Collection, ConnectionManager};
use crate::core::{
    CLIENT_ID_FIELD, ClientId, DatabaseError, Document, ID_FIELD, ObjectId, Result, StoreError,
    StoreResult,
};
use crate::resilience::{BatchPolicy, RetryPolicy};
use crate::storage::{Connector, FindQuery, MemoryStore, SortOrder, validate_collection_name};
use log::{debug, error, warn};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

/// Everything a [`Database`] needs, injected at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseConfig {
    pub connection: ConnectionConfig,
    pub retry: RetryPolicy,
    pub batch: BatchPolicy,
}

impl DatabaseConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn batch(mut self, batch: BatchPolicy) -> Self {
        self.batch = batch;
        self
    }

    /// Connection settings from `COVULOR_DB_URL` / `COVULOR_DB_NAME`
    pub fn from_env() -> Result<Self> {
        let connection = ConnectionConfig::from_env().map_err(DatabaseError::InvalidConfig)?;
        Ok(Self::new(connection))
    }
}

/// Tenant-scoped operations over named collections.
///
/// Every read, update and delete is filtered by the caller's [`ClientId`];
/// an explicit `client_id` in caller filters is replaced, never trusted.
/// Store failures are logged and surface as neutral values (`None`, empty
/// pages, `0`, empty id) so callers see the same shape either way.
///
/// The value holds only immutable configuration and is cheap to clone.
#[derive(Clone)]
pub struct Database {
    manager: ConnectionManager,
    retry: RetryPolicy,
    batch: BatchPolicy,
}

impl Database {
    pub fn new(config: DatabaseConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config
            .connection
            .validate()
            .map_err(DatabaseError::InvalidConfig)?;

        Ok(Self {
            manager: ConnectionManager::new(config.connection, connector),
            retry: config.retry,
            batch: config.batch,
        })
    }

    /// Database backed by an in-process [`MemoryStore`]
    pub fn in_memory(store: &MemoryStore, config: DatabaseConfig) -> Result<Self> {
        Self::new(config, Arc::new(store.clone()))
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.manager.config()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn batch_policy(&self) -> &BatchPolicy {
        &self.batch
    }

    /// Run `op` against `collection` on a fresh connection, retrying rate limits.
    ///
    /// Each attempt opens its own connection, which is closed before the
    /// attempt's result is inspected.
    pub async fn execute<T, F, Fut>(&self, collection: &str, op: F) -> Result<T>
    where
        F: Fn(Collection) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        validate_collection_name(collection).map_err(DatabaseError::InvalidCollectionName)?;

        let span = tracing::debug_span!("execute", collection = %collection);
        let manager = &self.manager;
        let op = &op;

        self.retry
            .run(collection, || async move {
                let guard = manager.open().await?;
                let handle = guard.collection(collection)?;
                let result = op(handle).await;
                guard.close();
                result
            })
            .instrument(span)
            .await
    }

    /// Paginated, sorted read of every record matching `options.filters`.
    pub async fn find_many(
        &self,
        collection: &str,
        client_id: &ClientId,
        options: &FindOptions,
    ) -> Page {
        let filter = tenant_filter(client_id, &options.filters);
        let pagination = &options.pagination;
        let page_size = pagination.effective_page_size();
        let skip = if pagination.paginate { pagination.skip() } else { 0 };

        let query = FindQuery {
            filter: filter.clone(),
            projection: options.fields.clone().unwrap_or_default(),
            sort: Some((options.sort.field.clone(), options.sort.order)),
            skip,
            limit: pagination.paginate.then_some(page_size),
        };

        let result = self
            .execute(collection, |c| {
                let filter = &filter;
                let query = &query;
                async move {
                    let total = c.count(filter).await?;
                    let data = c.find(query).await?;
                    Ok::<_, StoreError>((total, data))
                }
            })
            .await;

        match result {
            Ok((total, data)) => Page {
                data,
                meta: pagination.paginate.then(|| PageMeta {
                    pagination: PaginationMeta::new(pagination.page, page_size, total),
                }),
            },
            Err(err) => {
                error!("find_many on {} failed: {}", collection, err);
                Page::empty()
            }
        }
    }

    /// Single record by id within the tenant, optionally narrowed further.
    pub async fn find_one(
        &self,
        collection: &str,
        client_id: &ClientId,
        id: &str,
        extra_filters: Option<&Document>,
    ) -> Option<Document> {
        let filter = id_filter(client_id, id, extra_filters)?;

        match self
            .execute(collection, |c| {
                let filter = &filter;
                async move { c.find_one(filter).await }
            })
            .await
        {
            Ok(found) => found,
            Err(err) => {
                error!("find_one {} on {} failed: {}", id, collection, err);
                None
            }
        }
    }

    /// `$set` the given fields; returns the updated record only when something changed.
    pub async fn update_one(
        &self,
        collection: &str,
        client_id: &ClientId,
        id: &str,
        set: &Document,
        extra_filters: Option<&Document>,
    ) -> Option<Document> {
        match self
            .update_one_detailed(collection, client_id, id, set, extra_filters)
            .await
        {
            Ok(outcome) => outcome.into_updated(),
            Err(err) => {
                error!("update_one {} on {} failed: {}", id, collection, err);
                None
            }
        }
    }

    /// Like [`Database::update_one`] but tells "not found" apart from "nothing changed".
    ///
    /// `_id` and `client_id` are not updatable and are dropped from `set`.
    pub async fn update_one_detailed(
        &self,
        collection: &str,
        client_id: &ClientId,
        id: &str,
        set: &Document,
        extra_filters: Option<&Document>,
    ) -> Result<UpdateOutcome> {
        let (Some(filter), Some(reread)) = (
            id_filter(client_id, id, extra_filters),
            id_filter(client_id, id, None),
        ) else {
            return Ok(UpdateOutcome::NotFound);
        };

        let mut changes = set.clone();
        for key in [ID_FIELD, CLIENT_ID_FIELD] {
            if changes.remove(key).is_some() {
                warn!("ignoring update of immutable field '{}' on {}", key, collection);
            }
        }

        let (result, current) = self
            .execute(collection, |c| {
                let filter = &filter;
                let reread = &reread;
                let changes = &changes;
                async move {
                    let result = c.update_one(filter, changes).await?;
                    // extra filters may no longer match after the write
                    let current = c.find_one(reread).await?;
                    Ok::<_, StoreError>((result, current))
                }
            })
            .await?;

        Ok(match current {
            Some(document) if result.modified_count > 0 => UpdateOutcome::Updated(document),
            Some(document) if result.matched_count > 0 => UpdateOutcome::Unchanged(document),
            _ => UpdateOutcome::NotFound,
        })
    }

    /// Remove one record, returning it.
    pub async fn delete_one(
        &self,
        collection: &str,
        client_id: &ClientId,
        id: &str,
    ) -> Option<Document> {
        let filter = id_filter(client_id, id, None)?;

        let result = self
            .execute(collection, |c| {
                let filter = &filter;
                async move {
                    let Some(existing) = c.find_one(filter).await? else {
                        return Ok::<_, StoreError>(None);
                    };
                    let deleted = c.delete_one(filter).await?;
                    Ok((deleted > 0).then_some(existing))
                }
            })
            .await;

        match result {
            Ok(deleted) => deleted,
            Err(err) => {
                error!("delete_one {} on {} failed: {}", id, collection, err);
                None
            }
        }
    }

    /// Remove every matching record in batches, returning how many were deleted.
    ///
    /// Ids are fetched `batch_size` at a time and removed with one request per
    /// batch. A rate limited batch is retried after `retry_delay`, at most
    /// `max_retries` times; any other failure stops the loop and the count so
    /// far is returned.
    pub async fn delete_many(
        &self,
        collection: &str,
        client_id: &ClientId,
        filters: &Document,
    ) -> u64 {
        let filter = tenant_filter(client_id, filters);
        let query = FindQuery {
            filter,
            projection: vec![ID_FIELD.to_string()],
            sort: Some((ID_FIELD.to_string(), SortOrder::Ascending)),
            skip: 0,
            limit: Some(self.batch.batch_size.max(1) as u64),
        };

        let mut total = 0u64;
        loop {
            let ids = match self
                .execute(collection, |c| {
                    let query = &query;
                    async move { c.find(query).await }
                })
                .await
            {
                Ok(documents) => documents
                    .into_iter()
                    .filter_map(|mut d| d.remove(ID_FIELD))
                    .collect::<Vec<_>>(),
                Err(err) => {
                    error!("delete_many on {} stopped fetching ids: {}", collection, err);
                    break;
                }
            };

            if ids.is_empty() {
                break;
            }

            let batch = ids.len();
            let mut batch_filter = Document::new();
            batch_filter.insert(ID_FIELD.to_string(), json!({ "$in": ids }));
            batch_filter.insert(CLIENT_ID_FIELD.to_string(), client_id.as_str().into());

            match self.delete_batch(collection, &batch_filter).await {
                Ok(0) => {
                    warn!("delete_many on {} removed none of {} ids", collection, batch);
                    break;
                }
                Ok(deleted) => {
                    debug!("deleted batch of {} from {}", deleted, collection);
                    total += deleted;
                }
                Err(err) => {
                    error!("delete_many on {} aborted after {} deletions: {}", collection, total, err);
                    break;
                }
            }
        }

        total
    }

    async fn delete_batch(&self, collection: &str, filter: &Document) -> Result<u64> {
        validate_collection_name(collection).map_err(DatabaseError::InvalidCollectionName)?;

        let mut retries = 0u32;
        loop {
            let attempt = async {
                let guard = self.manager.open().await?;
                let deleted = guard.collection(collection)?.delete_many(filter).await;
                guard.close();
                deleted
            }
            .await;

            match attempt {
                Ok(deleted) => return Ok(deleted),
                Err(err) if err.is_transient() && retries < self.batch.max_retries => {
                    retries += 1;
                    warn!(
                        "batch delete on {} rate limited, retry {}/{} in {:?}",
                        collection, retries, self.batch.max_retries, self.batch.retry_delay
                    );
                    tokio::time::sleep(self.batch.retry_delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(DatabaseError::RetriesExhausted {
                        attempts: retries + 1,
                        last: err,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Insert a document and return its id, or an empty string on failure.
    ///
    /// The document must carry a non-empty `client_id`.
    pub async fn insert_one(&self, collection: &str, document: Document) -> String {
        let has_tenant = document
            .get(CLIENT_ID_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|c| !c.trim().is_empty());
        if !has_tenant {
            error!("refusing insert into {} without a client_id", collection);
            return String::new();
        }

        match self
            .execute(collection, |c| {
                let document = document.clone();
                async move { c.insert_one(document).await }
            })
            .await
        {
            Ok(id) => id,
            Err(err) => {
                error!("insert_one on {} failed: {}", collection, err);
                String::new()
            }
        }
    }

    pub async fn count_documents(
        &self,
        collection: &str,
        client_id: &ClientId,
        filters: &Document,
    ) -> u64 {
        let filter = tenant_filter(client_id, filters);

        match self
            .execute(collection, |c| {
                let filter = &filter;
                async move { c.count(filter).await }
            })
            .await
        {
            Ok(count) => count,
            Err(err) => {
                error!("count_documents on {} failed: {}", collection, err);
                0
            }
        }
    }

    /// Run an aggregation pipeline over the tenant's records only.
    pub async fn aggregate(
        &self,
        collection: &str,
        client_id: &ClientId,
        pipeline: &[Document],
    ) -> Vec<Document> {
        let mut stages = Vec::with_capacity(pipeline.len() + 1);
        let mut scope = Document::new();
        scope.insert(
            "$match".to_string(),
            Value::Object(tenant_filter(client_id, &Document::new())),
        );
        stages.push(scope);
        stages.extend_from_slice(pipeline);

        match self
            .execute(collection, |c| {
                let stages = &stages;
                async move { c.aggregate(stages).await }
            })
            .await
        {
            Ok(documents) => documents,
            Err(err) => {
                error!("aggregate on {} failed: {}", collection, err);
                Vec::new()
            }
        }
    }

    /// Unscoped single lookup, for cross-tenant uniqueness checks.
    pub(crate) async fn find_one_unscoped(
        &self,
        collection: &str,
        filter: &Document,
    ) -> Result<Option<Document>> {
        self.execute(collection, |c| async move { c.find_one(filter).await })
            .await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.manager.config().redacted_url())
            .field("retry", &self.retry)
            .field("batch", &self.batch)
            .finish()
    }
}

/// Caller filters with the tenant constraint forced on top.
pub fn tenant_filter(client_id: &ClientId, filters: &Document) -> Document {
    let mut filter = filters.clone();
    if let Some(previous) = filter.insert(CLIENT_ID_FIELD.to_string(), client_id.as_str().into()) {
        if previous.as_str() != Some(client_id.as_str()) {
            warn!("replacing caller supplied client_id filter {}", previous);
        }
    }
    filter
}

fn id_filter(client_id: &ClientId, id: &str, extra_filters: Option<&Document>) -> Option<Document> {
    let id = match id.parse::<ObjectId>() {
        Ok(id) => id,
        Err(err @ StoreError::InvalidId(_)) => {
            warn!("{}", err);
            return None;
        }
        Err(err) => {
            error!("{}", err);
            return None;
        }
    };

    let mut filter = tenant_filter(client_id, extra_filters.unwrap_or(&Document::new()));
    filter.insert(ID_FIELD.to_string(), id.to_hex().into());
    Some(filter)
}
