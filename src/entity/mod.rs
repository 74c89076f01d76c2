//! Typed services for the platform's entities.
//!
//! Each service wraps a [`Database`](crate::Database) with the entity's own
//! creation rule and converts stored documents into a validated model.

pub mod finding;
pub mod repository;

pub use finding::{Finding, FindingModel, FindingPatch};
pub use repository::{GitConnection, NewRepository, Repository, RepositoryData, RepositoryModel, RepositoryPatch};

use crate::core::{Document, ID_FIELD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EntityError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required field '{0}'")]
    MissingField(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type EntityResult<T> = std::result::Result<T, EntityError>;

/// Which records a new finding is deduplicated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupScope {
    /// Every tenant's findings
    #[default]
    Global,
    /// Only findings of the submitting tenant
    Tenant,
}

/// Result of a service level `delete_many`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub deleted_count: u64,
}

/// A stored entity with a fixed field registry and value bounds.
pub trait EntityModel: Serialize + DeserializeOwned + Sized {
    /// Store keys that must be present
    const REQUIRED: &'static [&'static str];

    /// Bounds and patterns beyond what the types enforce
    fn validate(&self) -> EntityResult<()>;

    /// Store id, when the model was read from or written to the store
    fn object_id(&self) -> Option<&str>;

    fn set_object_id(&mut self, id: String);

    /// Check, decode and validate a stored document.
    fn from_document(document: Document) -> EntityResult<Self> {
        for field in Self::REQUIRED {
            if !document.contains_key(*field) {
                return Err(EntityError::MissingField(field.to_string()));
            }
        }

        let id = match document.get(ID_FIELD) {
            Some(Value::String(id)) => Some(id.clone()),
            _ => None,
        };

        let mut model: Self = serde_json::from_value(Value::Object(document))
            .map_err(|e| EntityError::Validation(e.to_string()))?;
        model.validate()?;

        if let Some(id) = id {
            model.set_object_id(id);
        }
        Ok(model)
    }

    /// Document form for the store; never carries `_id`.
    fn to_document(&self) -> EntityResult<Document> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut document)) => {
                document.remove(ID_FIELD);
                Ok(document)
            }
            Ok(other) => Err(EntityError::Serialization(format!(
                "expected an object, got {}",
                other
            ))),
            Err(e) => Err(EntityError::Serialization(e.to_string())),
        }
    }
}

/// A partial update expressed as typed optional fields.
pub trait EntityPatch: Serialize {
    fn validate(&self) -> EntityResult<()> {
        Ok(())
    }

    /// Fields to `$set`; unset options are left out.
    fn to_set(&self) -> EntityResult<Document> {
        self.validate()?;
        match serde_json::to_value(self) {
            Ok(Value::Object(set)) => Ok(set),
            Ok(other) => Err(EntityError::Serialization(format!(
                "expected an object, got {}",
                other
            ))),
            Err(e) => Err(EntityError::Serialization(e.to_string())),
        }
    }
}

pub(crate) fn check_range(field: &str, value: i64, min: i64, max: Option<i64>) -> EntityResult<()> {
    if value < min || max.is_some_and(|max| value > max) {
        let bounds = match max {
            Some(max) => format!("between {} and {}", min, max),
            None => format!("at least {}", min),
        };
        return Err(EntityError::Validation(format!(
            "'{}' must be {}, got {}",
            field, bounds, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert!(check_range("confidence", 0, 0, Some(100)).is_ok());
        assert!(check_range("confidence", 100, 0, Some(100)).is_ok());
        assert!(check_range("line", 1_000_000, 1, None).is_ok());

        assert_eq!(
            check_range("confidence", 101, 0, Some(100)),
            Err(EntityError::Validation(
                "'confidence' must be between 0 and 100, got 101".to_string()
            ))
        );
        assert!(check_range("line", 0, 1, None).is_err());
    }

    #[test]
    fn test_delete_summary_shape() {
        let summary = DeleteSummary { deleted_count: 2 };
        assert_eq!(
            serde_json::to_value(summary).unwrap(),
            serde_json::json!({"deleted_count": 2})
        );
    }
}
