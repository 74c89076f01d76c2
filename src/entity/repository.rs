use super::{DeleteSummary, EntityError, EntityModel, EntityPatch, EntityResult};
use crate::collections;
use crate::core::{ClientId, DatabaseError, Document};
use crate::facade::{Database, DatabaseConfig, FindOptions, Page};
use crate::storage::Connector;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Source repositories connected by a client.
///
/// A repository's `url` is unique across all clients.
#[derive(Debug, Clone)]
pub struct Repository {
    db: Database,
}

impl Repository {
    pub const ACTIVE: &'static str = "active";
    pub const BRANCH: &'static str = "repository_branch";
    pub const CLIENT_ID: &'static str = "client_id";
    pub const DESCRIPTION: &'static str = "description";
    pub const ID: &'static str = "repository_id";
    pub const NAME: &'static str = "alias";
    pub const PRIORITY: &'static str = "priority";
    pub const PROCESSING_STATUS: &'static str = "processing_status";
    pub const SOURCE_CONTROL: &'static str = "source_control";
    pub const TAGS: &'static str = "tags";
    pub const TICKET_API_URL: &'static str = "ticket_api_url";
    pub const TICKET_AUTH: &'static str = "ticket_auth";
    pub const TICKET_PROVIDER_TYPE: &'static str = "ticket_provider_type";
    pub const TYPE: &'static str = "repository_type";
    pub const URL: &'static str = "url";

    pub const COLLECTION: &'static str = collections::REPOSITORY;

    pub fn new(config: DatabaseConfig, connector: Arc<dyn Connector>) -> Result<Self, DatabaseError> {
        Ok(Self::with_database(Database::new(config, connector)?))
    }

    pub fn with_database(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register a repository unless one with the same url already exists.
    ///
    /// Returns `Ok(None)` for a known url or a failed lookup or insert.
    pub async fn create(&self, input: NewRepository) -> EntityResult<Option<RepositoryModel>> {
        let mut model = input.into_model();
        model.validate()?;

        let mut lookup = Document::new();
        lookup.insert(Self::URL.to_string(), Value::String(model.url.clone()));

        match self.db.find_one_unscoped(Self::COLLECTION, &lookup).await {
            Ok(Some(_)) => {
                warn!("repository {} already exists", model.url);
                return Ok(None);
            }
            Ok(None) => {}
            Err(err) => {
                error!("repository lookup failed: {}", err);
                return Ok(None);
            }
        }

        let id = self.db.insert_one(Self::COLLECTION, model.to_document()?).await;
        if id.is_empty() {
            return Ok(None);
        }

        info!("created repository {} for client {}", id, model.client_id);
        model.set_object_id(id);
        Ok(Some(model))
    }

    /// Like [`Repository::create`], taking the raw creation payload.
    pub async fn create_from_document(&self, data: Document) -> EntityResult<Option<RepositoryModel>> {
        let input: NewRepository = serde_json::from_value(Value::Object(data))
            .map_err(|e| EntityError::Validation(e.to_string()))?;
        self.create(input).await
    }

    pub async fn find_one(&self, client_id: &ClientId, id: &str) -> EntityResult<Option<RepositoryModel>> {
        self.db
            .find_one(Self::COLLECTION, client_id, id, None)
            .await
            .map(RepositoryModel::from_document)
            .transpose()
    }

    pub async fn find_many(
        &self,
        client_id: &ClientId,
        options: &FindOptions,
    ) -> EntityResult<Page<RepositoryModel>> {
        self.db
            .find_many(Self::COLLECTION, client_id, options)
            .await
            .try_map(RepositoryModel::from_document)
    }

    pub async fn update(
        &self,
        client_id: &ClientId,
        id: &str,
        patch: &RepositoryPatch,
    ) -> EntityResult<Option<RepositoryModel>> {
        self.update_document(client_id, id, &patch.to_set()?).await
    }

    pub async fn update_document(
        &self,
        client_id: &ClientId,
        id: &str,
        set: &Document,
    ) -> EntityResult<Option<RepositoryModel>> {
        self.db
            .update_one(Self::COLLECTION, client_id, id, set, None)
            .await
            .map(RepositoryModel::from_document)
            .transpose()
    }

    pub async fn delete(&self, client_id: &ClientId, id: &str) -> EntityResult<Option<RepositoryModel>> {
        self.db
            .delete_one(Self::COLLECTION, client_id, id)
            .await
            .map(RepositoryModel::from_document)
            .transpose()
    }

    pub async fn delete_many(&self, client_id: &ClientId, filters: &Document) -> DeleteSummary {
        DeleteSummary {
            deleted_count: self.db.delete_many(Self::COLLECTION, client_id, filters).await,
        }
    }
}

/// Creation payload; only these fields reach the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepository {
    pub uri: String,
    pub client_id: String,
    #[serde(rename = "type")]
    pub repository_type: String,
    pub nickname: String,
    #[serde(default)]
    pub description: String,
    pub data: RepositoryData,
    #[serde(default)]
    pub source_control: Option<String>,
    #[serde(default)]
    pub priority: Value,
    #[serde(default)]
    pub tags: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryData {
    pub git_connection: GitConnection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitConnection {
    pub repo_branch: String,
}

impl NewRepository {
    fn into_model(self) -> RepositoryModel {
        RepositoryModel {
            object_id: None,
            active: true,
            url: self.uri,
            client_id: self.client_id,
            repository_type: self.repository_type,
            alias: self.nickname,
            ticket_provider_type: None,
            ticket_auth: None,
            ticket_api_url: None,
            description: self.description,
            processing_status: "processing".to_string(),
            repository_branch: Some(self.data.git_connection.repo_branch),
            source_control: self.source_control,
            priority: self.priority,
            tags: self.tags,
        }
    }
}

fn default_active() -> bool {
    true
}

fn default_processing_status() -> String {
    "processing".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryModel {
    #[serde(rename = "_id", default, skip_serializing)]
    pub object_id: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub url: String,
    pub client_id: String,
    #[serde(default)]
    pub repository_type: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub ticket_provider_type: Option<Value>,
    #[serde(default)]
    pub ticket_auth: Option<Value>,
    #[serde(default)]
    pub ticket_api_url: Option<Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_processing_status")]
    pub processing_status: String,
    #[serde(default)]
    pub repository_branch: Option<String>,
    #[serde(default)]
    pub source_control: Option<String>,
    #[serde(default)]
    pub priority: Value,
    #[serde(default)]
    pub tags: Vec<Value>,
}

impl EntityModel for RepositoryModel {
    const REQUIRED: &'static [&'static str] = &[Repository::URL, Repository::CLIENT_ID];

    fn validate(&self) -> EntityResult<()> {
        if self.url.trim().is_empty() {
            return Err(EntityError::Validation(format!("'{}' cannot be empty", Repository::URL)));
        }
        if self.client_id.trim().is_empty() {
            return Err(EntityError::Validation(format!(
                "'{}' cannot be empty",
                Repository::CLIENT_ID
            )));
        }
        Ok(())
    }

    fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    fn set_object_id(&mut self, id: String) {
        self.object_id = Some(id);
    }
}

/// Updatable repository settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_provider_type: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_auth: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_api_url: Option<Value>,
}

impl EntityPatch for RepositoryPatch {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "uri": "https://github.com/x/y",
            "client_id": "123",
            "type": "git_repository",
            "nickname": "x/y",
            "description": "",
            "github_oauth_token": "secret",
            "data": {"git_connection": {"repo_url": "https://github.com/x/y", "repo_branch": "main"}},
            "source_control": "github",
            "priority": "high",
            "tags": ["example"]
        })
    }

    #[test]
    fn test_new_repository_has_fixed_shape() {
        let input: NewRepository = serde_json::from_value(payload()).unwrap();
        let document = input.into_model().to_document().unwrap();

        assert_eq!(
            Value::Object(document),
            json!({
                "active": true,
                "url": "https://github.com/x/y",
                "client_id": "123",
                "repository_type": "git_repository",
                "alias": "x/y",
                "ticket_provider_type": null,
                "ticket_auth": null,
                "ticket_api_url": null,
                "description": "",
                "processing_status": "processing",
                "repository_branch": "main",
                "source_control": "github",
                "priority": "high",
                "tags": ["example"]
            })
        );
    }

    #[test]
    fn test_missing_branch_is_rejected() {
        let mut data = payload();
        data["data"] = json!({"git_connection": {}});

        assert!(serde_json::from_value::<NewRepository>(data).is_err());
    }

    #[test]
    fn test_model_requires_url() {
        let document = json!({"client_id": "123"}).as_object().cloned().unwrap();

        assert_eq!(
            RepositoryModel::from_document(document),
            Err(EntityError::MissingField("url".to_string()))
        );
    }

    #[test]
    fn test_patch() {
        let patch = RepositoryPatch {
            active: Some(false),
            ..Default::default()
        };

        assert_eq!(Value::Object(patch.to_set().unwrap()), json!({"active": false}));
    }
}
