use super::{DedupScope, DeleteSummary, EntityError, EntityModel, EntityPatch, EntityResult, check_range};
use crate::collections;
use crate::core::{ClientId, DatabaseError, Document, ID_FIELD};
use crate::facade::{Database, DatabaseConfig, FindOptions, Page};
use crate::storage::Connector;
use lazy_static::lazy_static;
use log::{debug, error, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

lazy_static! {
    static ref DATE_PATTERN: Regex = Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap();
}

/// Security findings reported by scanners.
///
/// New findings are deduplicated on `(cwe, file_path, original_line, tool)`:
/// a submission matching an existing record is stored as a duplicate that
/// points at it.
#[derive(Debug, Clone)]
pub struct Finding {
    db: Database,
    dedup: DedupScope,
}

impl Finding {
    pub const ACCESS_CREDENTIAL: &'static str = "access_credential";
    pub const ACTUAL_LINE: &'static str = "line";
    pub const ASVS_ID: &'static str = "asvs_id";
    pub const ASVS_SECTION: &'static str = "asvs_section";
    pub const CLIENT_ID: &'static str = "client_id";
    pub const CONFIDENCE: &'static str = "confidence";
    pub const CVSSV3_SCORE: &'static str = "cvssv3_score";
    pub const CVSSV3_VECTOR: &'static str = "cvssv3_vector";
    pub const CWES: &'static str = "cwe";
    pub const DATA_SOURCE: &'static str = "data_source";
    pub const DATE: &'static str = "date";
    pub const DESCRIPTION: &'static str = "description";
    pub const DUPLICATE_ID: &'static str = "duplicate_finding_id";
    pub const END_COLUMN: &'static str = "end_column";
    pub const EPSS: &'static str = "estimated_epss";
    pub const EXCLUDED_FILE_TYPES: &'static str = "excluded_file_types";
    pub const FILE: &'static str = "file_path";
    pub const FIXING_EFFORT: &'static str = "effort_for_fixing";
    pub const IAC: &'static str = "iac";
    pub const ID: &'static str = "finding_id";
    pub const IMPACT: &'static str = "impact";
    pub const IS_DUPLICATE: &'static str = "duplicate";
    pub const IS_FALSE_POSITIVE: &'static str = "is_false_positive";
    pub const IS_MITIGATED_EXTERNALLY: &'static str = "is_mitigated_externally";
    pub const ISSUE_OWNER: &'static str = "issue_owner";
    pub const LANGUAGE: &'static str = "language";
    pub const LIKELIHOOD: &'static str = "likelihood";
    pub const MITIGATION: &'static str = "mitigation";
    pub const NB_OCCURRENCES: &'static str = "nb_occurrences";
    pub const NOTES: &'static str = "notes";
    pub const NUMERICAL_SEVERITY: &'static str = "severity_numerical";
    pub const ORIGINAL_LINE: &'static str = "original_line";
    pub const OWASPS: &'static str = "owasps";
    pub const PLATFORM: &'static str = "platform";
    pub const PRIORITY: &'static str = "prioritization_value";
    pub const PROCESSING_STATUS: &'static str = "processing_status";
    pub const PROVIDER: &'static str = "provider";
    pub const RECORD_SOURCE: &'static str = "record_source";
    pub const REFERENCES: &'static str = "references";
    pub const REMEDIATION_TYPE: &'static str = "remediation_type";
    pub const REPOSITORY_ID: &'static str = "repo_id";
    pub const RESOURCE_ENTITY: &'static str = "resource_entity";
    pub const REVIEW_REQUESTED_BY: &'static str = "review_requested_by_id";
    pub const SAST_SINK_OBJECT: &'static str = "sast_sink_object";
    pub const SAST_SOURCE_FILE: &'static str = "sast_source_file_path";
    pub const SAST_SOURCE_LINE: &'static str = "sast_source_line";
    pub const SAST_SOURCE_OBJECT: &'static str = "sast_source_object";
    pub const SCAN_ID: &'static str = "scan_id";
    pub const SCANNER_REPORT: &'static str = "scanner_report";
    pub const SCANNER_REPORT_CODE: &'static str = "scanner_report_code";
    pub const SCANNER_WEAKNESS: &'static str = "scanner_weakness";
    pub const SERVICE: &'static str = "service";
    pub const SEVERITY: &'static str = "severity";
    pub const SLSA_THREATS: &'static str = "slsa_threats";
    pub const START_COLUMN: &'static str = "start_column";
    pub const STATUS: &'static str = "status";
    pub const SUPPLY_CHAINS: &'static str = "supply_chains";
    pub const TAGS: &'static str = "tags";
    pub const TARGET_FILE_TYPES: &'static str = "target_file_types";
    pub const TITLE: &'static str = "title";
    pub const TOOL: &'static str = "tool";
    pub const TYPE: &'static str = "vuln_type";

    pub const COLLECTION: &'static str = collections::FINDING;

    /// Status given to every newly created finding
    pub const PROCESSING: &'static str = "processing";

    pub fn new(config: DatabaseConfig, connector: Arc<dyn Connector>) -> Result<Self, DatabaseError> {
        Ok(Self::with_database(Database::new(config, connector)?))
    }

    pub fn with_database(db: Database) -> Self {
        Self {
            db,
            dedup: DedupScope::default(),
        }
    }

    pub fn dedup_scope(mut self, scope: DedupScope) -> Self {
        self.dedup = scope;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Store a new finding, merging it into an existing one with the same dedup key.
    ///
    /// When a match exists its fields replace the submitted ones, except
    /// `title` and `client_id`, and the new record is flagged as a duplicate
    /// of it. Schema failures are returned before anything is written. A
    /// failed lookup or insert yields `Ok(None)`.
    pub async fn create(&self, mut data: Document) -> EntityResult<Option<FindingModel>> {
        let key = self.dedup_key(&data)?;

        let existing = match self.db.find_one_unscoped(Self::COLLECTION, &key).await {
            Ok(existing) => existing,
            Err(err) => {
                error!("finding dedup lookup failed: {}", err);
                return Ok(None);
            }
        };

        if let Some(existing) = existing {
            let canonical_id = match existing.get(ID_FIELD) {
                Some(Value::String(id)) => id.clone(),
                _ => String::new(),
            };
            debug!("finding is a duplicate of {}", canonical_id);

            let title = data.get(Self::TITLE).cloned();
            let client_id = data.get(Self::CLIENT_ID).cloned();

            data.extend(existing);
            restore(&mut data, Self::TITLE, title);
            restore(&mut data, Self::CLIENT_ID, client_id);
            data.insert(Self::IS_DUPLICATE.to_string(), Value::Bool(true));
            data.insert(Self::DUPLICATE_ID.to_string(), Value::String(canonical_id));
            data.remove(ID_FIELD);
        }

        data.insert(Self::PROCESSING_STATUS.to_string(), Self::PROCESSING.into());
        let mut model = FindingModel::from_document(data)?;

        let id = self.db.insert_one(Self::COLLECTION, model.to_document()?).await;
        if id.is_empty() {
            return Ok(None);
        }

        info!("created finding {} for client {}", id, model.client_id);
        model.set_object_id(id);
        Ok(Some(model))
    }

    fn dedup_key(&self, data: &Document) -> EntityResult<Document> {
        let mut key = Document::new();
        key.insert(Self::CWES.to_string(), cwe_set_condition(data.get(Self::CWES)));
        for field in [Self::FILE, Self::ORIGINAL_LINE, Self::TOOL] {
            let value = data
                .get(field)
                .ok_or_else(|| EntityError::MissingField(field.to_string()))?;
            key.insert(field.to_string(), value.clone());
        }

        if self.dedup == DedupScope::Tenant {
            let client_id = data
                .get(Self::CLIENT_ID)
                .ok_or_else(|| EntityError::MissingField(Self::CLIENT_ID.to_string()))?;
            key.insert(Self::CLIENT_ID.to_string(), client_id.clone());
        }

        Ok(key)
    }

    pub async fn find_one(&self, client_id: &ClientId, id: &str) -> EntityResult<Option<FindingModel>> {
        self.db
            .find_one(Self::COLLECTION, client_id, id, None)
            .await
            .map(FindingModel::from_document)
            .transpose()
    }

    pub async fn find_many(&self, client_id: &ClientId, options: &FindOptions) -> EntityResult<Page<FindingModel>> {
        self.db
            .find_many(Self::COLLECTION, client_id, options)
            .await
            .try_map(FindingModel::from_document)
    }

    /// Apply a typed patch; `None` when nothing matched or nothing changed.
    pub async fn update(
        &self,
        client_id: &ClientId,
        id: &str,
        patch: &FindingPatch,
    ) -> EntityResult<Option<FindingModel>> {
        self.update_document(client_id, id, &patch.to_set()?).await
    }

    pub async fn update_document(
        &self,
        client_id: &ClientId,
        id: &str,
        set: &Document,
    ) -> EntityResult<Option<FindingModel>> {
        self.db
            .update_one(Self::COLLECTION, client_id, id, set, None)
            .await
            .map(FindingModel::from_document)
            .transpose()
    }

    pub async fn delete(&self, client_id: &ClientId, id: &str) -> EntityResult<Option<FindingModel>> {
        self.db
            .delete_one(Self::COLLECTION, client_id, id)
            .await
            .map(FindingModel::from_document)
            .transpose()
    }

    pub async fn delete_many(&self, client_id: &ClientId, filters: &Document) -> DeleteSummary {
        DeleteSummary {
            deleted_count: self.db.delete_many(Self::COLLECTION, client_id, filters).await,
        }
    }
}

/// Matches a stored `cwe` list holding the same distinct entries in any order.
fn cwe_set_condition(cwes: Option<&Value>) -> Value {
    let Some(Value::Array(items)) = cwes else {
        return cwes.cloned().unwrap_or_else(|| json!([]));
    };

    let mut distinct: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !distinct.contains(item) {
            distinct.push(item.clone());
        }
    }

    if distinct.is_empty() {
        return json!([]);
    }
    json!({ "$all": distinct, "$size": distinct.len() })
}

fn restore(data: &mut Document, field: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            data.insert(field.to_string(), value);
        }
        None => {
            data.remove(field);
        }
    }
}

fn default_confidence() -> i64 {
    100
}

fn default_column() -> Option<i64> {
    Some(1)
}

fn default_processing_status() -> String {
    Finding::PROCESSING.to_string()
}

fn default_status() -> String {
    "In Progress".to_string()
}

fn default_supply_chains() -> Vec<Value> {
    vec![json!("Source Code")]
}

fn default_vuln_type() -> String {
    "Code Weakness".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingModel {
    #[serde(rename = "_id", default, skip_serializing)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub access_credential: Option<String>,
    #[serde(rename = "line")]
    pub actual_line: i64,
    #[serde(default)]
    pub asvs_id: Option<String>,
    #[serde(default)]
    pub asvs_section: Option<String>,
    pub client_id: String,
    #[serde(default = "default_confidence")]
    pub confidence: i64,
    #[serde(default)]
    pub cvssv3_score: f64,
    #[serde(default)]
    pub cvssv3_vector: Vec<Value>,
    #[serde(rename = "cwe", default)]
    pub cwes: Vec<Value>,
    #[serde(default)]
    pub data_source: Option<String>,
    pub date: String,
    pub description: String,
    #[serde(rename = "duplicate_finding_id", default)]
    pub duplicate_id: Option<String>,
    #[serde(default = "default_column")]
    pub end_column: Option<i64>,
    #[serde(rename = "estimated_epss", default)]
    pub epss: i64,
    #[serde(default)]
    pub excluded_file_types: Vec<Value>,
    #[serde(rename = "file_path")]
    pub file: String,
    #[serde(rename = "effort_for_fixing", default)]
    pub fixing_effort: Option<String>,
    #[serde(default)]
    pub iac: Option<String>,
    #[serde(rename = "finding_id")]
    pub id: String,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(rename = "duplicate", default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub is_false_positive: bool,
    #[serde(default)]
    pub is_mitigated_externally: bool,
    #[serde(default)]
    pub issue_owner: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub likelihood: Option<String>,
    #[serde(default)]
    pub mitigation: Option<String>,
    #[serde(default)]
    pub nb_occurrences: Option<i64>,
    #[serde(default)]
    pub notes: Vec<Value>,
    #[serde(rename = "severity_numerical", default)]
    pub numerical_severity: i64,
    pub original_line: i64,
    #[serde(default)]
    pub owasps: Vec<Value>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(rename = "prioritization_value", default)]
    pub priority: i64,
    #[serde(default = "default_processing_status")]
    pub processing_status: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub record_source: Option<String>,
    #[serde(default)]
    pub references: Vec<Value>,
    #[serde(default)]
    pub remediation_type: Option<String>,
    #[serde(rename = "repo_id")]
    pub repository_id: String,
    #[serde(default)]
    pub resource_entity: Option<String>,
    #[serde(rename = "review_requested_by_id", default)]
    pub review_requested_by: Option<String>,
    #[serde(default)]
    pub sast_sink_object: Option<String>,
    #[serde(rename = "sast_source_file_path", default)]
    pub sast_source_file: Option<String>,
    #[serde(default)]
    pub sast_source_line: Option<String>,
    #[serde(default)]
    pub sast_source_object: Option<String>,
    #[serde(default)]
    pub scan_id: Option<String>,
    #[serde(default)]
    pub scanner_report: Option<String>,
    #[serde(default)]
    pub scanner_report_code: Option<String>,
    #[serde(default)]
    pub scanner_weakness: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub slsa_threats: Vec<Value>,
    #[serde(default = "default_column")]
    pub start_column: Option<i64>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_supply_chains")]
    pub supply_chains: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<Value>,
    #[serde(default)]
    pub target_file_types: Vec<Value>,
    pub title: String,
    pub tool: String,
    #[serde(rename = "vuln_type", default = "default_vuln_type")]
    pub vuln_type: String,
}

impl EntityModel for FindingModel {
    const REQUIRED: &'static [&'static str] = &[
        Finding::ACTUAL_LINE,
        Finding::CLIENT_ID,
        Finding::DATE,
        Finding::DESCRIPTION,
        Finding::FILE,
        Finding::ID,
        Finding::ORIGINAL_LINE,
        Finding::REPOSITORY_ID,
        Finding::SEVERITY,
        Finding::TITLE,
        Finding::TOOL,
    ];

    fn validate(&self) -> EntityResult<()> {
        check_range(Finding::ACTUAL_LINE, self.actual_line, 1, None)?;
        check_range(Finding::ORIGINAL_LINE, self.original_line, 1, None)?;
        check_range(Finding::CONFIDENCE, self.confidence, 0, Some(100))?;
        check_range(Finding::NUMERICAL_SEVERITY, self.numerical_severity, 0, Some(100))?;
        check_range(Finding::PRIORITY, self.priority, 0, Some(100))?;
        if let Some(column) = self.start_column {
            check_range(Finding::START_COLUMN, column, 0, None)?;
        }
        if let Some(column) = self.end_column {
            check_range(Finding::END_COLUMN, column, 0, None)?;
        }

        if self.cvssv3_score < 0.0 || self.cvssv3_score.is_nan() {
            return Err(EntityError::Validation(format!(
                "'{}' must be at least 0, got {}",
                Finding::CVSSV3_SCORE,
                self.cvssv3_score
            )));
        }

        if !DATE_PATTERN.is_match(&self.date) {
            return Err(EntityError::Validation(format!(
                "'{}' must look like YYYY-MM-DD, got '{}'",
                Finding::DATE,
                self.date
            )));
        }

        if self.client_id.trim().is_empty() {
            return Err(EntityError::Validation(format!(
                "'{}' cannot be empty",
                Finding::CLIENT_ID
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

/// Fields of a finding that callers change after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(rename = "severity_numerical", skip_serializing_if = "Option::is_none")]
    pub numerical_severity: Option<i64>,
    #[serde(rename = "prioritization_value", skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_false_positive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_mitigated_externally: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
    #[serde(rename = "effort_for_fixing", skip_serializing_if = "Option::is_none")]
    pub fixing_effort: Option<String>,
    #[serde(rename = "review_requested_by_id", skip_serializing_if = "Option::is_none")]
    pub review_requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Value>>,
}

impl EntityPatch for FindingPatch {
    fn validate(&self) -> EntityResult<()> {
        if let Some(value) = self.numerical_severity {
            check_range(Finding::NUMERICAL_SEVERITY, value, 0, Some(100))?;
        }
        if let Some(value) = self.priority {
            check_range(Finding::PRIORITY, value, 0, Some(100))?;
        }
        if let Some(value) = self.confidence {
            check_range(Finding::CONFIDENCE, value, 0, Some(100))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        json!({
            "tool": "semgrep",
            "title": "Open redirect",
            "repo_id": "r1",
            "line": 10,
            "client_id": "123",
            "date": "2024-03-01",
            "description": "",
            "file_path": "a.php",
            "finding_id": "f1",
            "original_line": 10,
            "severity": "high",
            "cwe": [601]
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_model_defaults() {
        let model = FindingModel::from_document(sample()).unwrap();

        assert_eq!(model.confidence, 100);
        assert_eq!(model.status, "In Progress");
        assert_eq!(model.vuln_type, "Code Weakness");
        assert_eq!(model.supply_chains, vec![json!("Source Code")]);
        assert_eq!(model.start_column, Some(1));
        assert!(!model.is_duplicate);
        assert_eq!(model.object_id, None);
    }

    #[test]
    fn test_document_uses_store_keys() {
        let mut model = FindingModel::from_document(sample()).unwrap();
        model.set_object_id("ignored".to_string());

        let document = model.to_document().unwrap();
        assert_eq!(document["file_path"], json!("a.php"));
        assert_eq!(document["line"], json!(10));
        assert_eq!(document["duplicate"], json!(false));
        assert_eq!(document["estimated_epss"], json!(0));
        assert!(!document.contains_key("_id"));
        assert!(!document.contains_key("file"));
    }

    #[test]
    fn test_missing_required_field() {
        let mut data = sample();
        data.remove("severity");

        assert_eq!(
            FindingModel::from_document(data),
            Err(EntityError::MissingField("severity".to_string()))
        );
    }

    #[test]
    fn test_bounds_and_patterns() {
        let cases = [
            ("line", json!(0)),
            ("confidence", json!(101)),
            ("severity_numerical", json!(-1)),
            ("cvssv3_score", json!(-0.5)),
            ("date", json!("March 1st")),
            ("client_id", json!("")),
        ];

        for (field, value) in cases {
            let mut data = sample();
            data.insert(field.to_string(), value);
            assert!(
                matches!(FindingModel::from_document(data), Err(EntityError::Validation(_))),
                "{} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_date_pattern_is_searched() {
        for date in ["2024-03-01", "2024-03-01T10:00:00Z", "on 2024-03-01"] {
            let mut data = sample();
            data.insert("date".to_string(), json!(date));
            assert!(FindingModel::from_document(data).is_ok(), "{} should be accepted", date);
        }
    }

    #[test]
    fn test_wrong_type_is_a_validation_error() {
        let mut data = sample();
        data.insert("line".to_string(), json!("ten"));

        assert!(matches!(
            FindingModel::from_document(data),
            Err(EntityError::Validation(_))
        ));
    }

    #[test]
    fn test_patch_only_sets_given_fields() {
        let patch = FindingPatch {
            status: Some("solved".to_string()),
            priority: Some(40),
            ..Default::default()
        };

        assert_eq!(
            Value::Object(patch.to_set().unwrap()),
            json!({"status": "solved", "prioritization_value": 40})
        );

        let invalid = FindingPatch {
            confidence: Some(150),
            ..Default::default()
        };
        assert!(invalid.to_set().is_err());
    }
}
