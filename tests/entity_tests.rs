/// Entity service tests
///
/// Finding deduplication and repository uniqueness on top of the memory store.
/// Run with: cargo test --test entity_tests
use covulor::{
    ClientId, Database, DatabaseConfig, DedupScope, Document, EntityError, Finding, FindingPatch,
    FindOptions, MemoryStore, NewRepository, Repository, RepositoryPatch, StoreError, StoreOp,
};
use serde_json::{Value, json};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn tenant(id: &str) -> ClientId {
    ClientId::new(id).unwrap()
}

fn database(store: &MemoryStore) -> Database {
    Database::in_memory(store, DatabaseConfig::default()).unwrap()
}

fn finding(client_id: &str, title: &str) -> Document {
    doc(json!({
        "cwe": [601],
        "file_path": "a.php",
        "original_line": 10,
        "line": 10,
        "tool": "x",
        "title": title,
        "client_id": client_id,
        "date": "2024-05-02",
        "description": "Unvalidated redirect",
        "finding_id": "f-1",
        "repo_id": "r-1",
        "severity": "medium",
        "status": "open"
    }))
}

fn new_repository(client_id: &str) -> NewRepository {
    serde_json::from_value(json!({
        "uri": "https://github.com/x/y",
        "client_id": client_id,
        "type": "git_repository",
        "nickname": "x/y",
        "description": "",
        "data": {"git_connection": {"repo_branch": "main"}},
        "source_control": "github",
        "priority": "high",
        "tags": ["example"]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_finding_dedup() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));

    let canonical = findings.create(finding("123", "first")).await.unwrap().unwrap();
    assert!(!canonical.is_duplicate);
    assert_eq!(canonical.processing_status, "processing");
    let canonical_id = canonical.object_id.clone().unwrap();

    let mut second = finding("123", "second");
    second.insert("severity".to_string(), json!("low"));
    let duplicate = findings.create(second).await.unwrap().unwrap();

    assert!(duplicate.is_duplicate);
    assert_eq!(duplicate.duplicate_id.as_deref(), Some(canonical_id.as_str()));
    assert_ne!(duplicate.object_id, canonical.object_id);
    // Existing fields win, except the submitted title
    assert_eq!(duplicate.title, "second");
    assert_eq!(duplicate.severity, "medium");
    assert_eq!(duplicate.status, "open");

    let stored = findings
        .find_one(&tenant("123"), duplicate.object_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, duplicate);

    // The canonical record is untouched
    let original = findings
        .find_one(&tenant("123"), &canonical_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original, canonical);
}

#[tokio::test]
async fn test_finding_dedup_key_differences() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));
    findings.create(finding("123", "first")).await.unwrap();

    for (field, value) in [
        ("cwe", json!([79])),
        ("file_path", json!("b.php")),
        ("original_line", json!(11)),
        ("tool", json!("y")),
    ] {
        let mut data = finding("123", "other");
        data.insert(field.to_string(), value);
        let created = findings.create(data).await.unwrap().unwrap();
        assert!(!created.is_duplicate, "{} should change the dedup key", field);
    }
}

#[tokio::test]
async fn test_finding_dedup_ignores_cwe_order() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));

    let mut first = finding("123", "first");
    first.insert("cwe".to_string(), json!([601, 79]));
    let canonical = findings.create(first).await.unwrap().unwrap();

    let mut second = finding("123", "second");
    second.insert("cwe".to_string(), json!([79, 601, 79]));
    let duplicate = findings.create(second).await.unwrap().unwrap();
    assert!(duplicate.is_duplicate);
    assert_eq!(duplicate.duplicate_id, canonical.object_id);

    // A subset is a different key
    let mut third = finding("123", "third");
    third.insert("cwe".to_string(), json!([79]));
    assert!(!findings.create(third).await.unwrap().unwrap().is_duplicate);
}

#[tokio::test]
async fn test_finding_dedup_scope() {
    let store = MemoryStore::new();
    let global = Finding::with_database(database(&store));
    let scoped = Finding::with_database(database(&store)).dedup_scope(DedupScope::Tenant);

    global.create(finding("A", "first")).await.unwrap();

    // Globally the other tenant's record is a match, but it stays under B
    let duplicate = global.create(finding("B", "second")).await.unwrap().unwrap();
    assert!(duplicate.is_duplicate);
    assert_eq!(duplicate.client_id, "B");

    let separate = scoped.create(finding("C", "third")).await.unwrap().unwrap();
    assert!(!separate.is_duplicate);
}

#[tokio::test]
async fn test_finding_validation_happens_before_write() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));

    let mut missing_key = finding("123", "t");
    missing_key.remove("tool");
    assert_eq!(
        findings.create(missing_key).await,
        Err(EntityError::MissingField("tool".to_string()))
    );

    let mut bad_date = finding("123", "t");
    bad_date.insert("date".to_string(), json!("yesterday"));
    assert!(matches!(
        findings.create(bad_date).await,
        Err(EntityError::Validation(_))
    ));

    let mut bad_confidence = finding("123", "t");
    bad_confidence.insert("confidence".to_string(), json!(250));
    assert!(matches!(
        findings.create(bad_confidence).await,
        Err(EntityError::Validation(_))
    ));

    assert_eq!(store.stats().calls(StoreOp::InsertOne), 0);
}

#[tokio::test]
async fn test_finding_insert_failure_yields_none() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));
    store.inject_failure(StoreOp::InsertOne, StoreError::Backend("write concern".into()));

    assert_eq!(findings.create(finding("123", "t")).await, Ok(None));
}

#[tokio::test]
async fn test_finding_update_and_delete() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));
    let client = tenant("123");
    let created = findings.create(finding("123", "t")).await.unwrap().unwrap();
    let id = created.object_id.clone().unwrap();

    let patch = FindingPatch {
        status: Some("solved".to_string()),
        ..Default::default()
    };
    let updated = findings.update(&client, &id, &patch).await.unwrap().unwrap();
    assert_eq!(updated.status, "solved");
    assert_eq!(updated.title, created.title);
    assert_eq!(updated.severity, created.severity);

    assert_eq!(findings.update(&client, &id, &patch).await, Ok(None));

    // A raw update that breaks the schema surfaces on the way back
    let broken = doc(json!({"severity_numerical": 500}));
    assert!(matches!(
        findings.update_document(&client, &id, &broken).await,
        Err(EntityError::Validation(_))
    ));

    let page = findings.find_many(&client, &FindOptions::default()).await;
    assert!(page.is_err());

    findings
        .update_document(&client, &id, &doc(json!({"severity_numerical": 50})))
        .await
        .unwrap();
    let page = findings.find_many(&client, &FindOptions::default()).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.pagination().unwrap().total, 1);

    let removed = findings.delete(&client, &id).await.unwrap().unwrap();
    assert_eq!(removed.object_id.as_deref(), Some(id.as_str()));
    assert_eq!(findings.find_one(&client, &id).await, Ok(None));
}

#[tokio::test]
async fn test_finding_delete_many() {
    let store = MemoryStore::new();
    let findings = Finding::with_database(database(&store));
    for line in 1..=4 {
        let mut data = finding("123", "t");
        data.insert("original_line".to_string(), json!(line));
        findings.create(data).await.unwrap();
    }

    let summary = findings
        .delete_many(&tenant("123"), &doc(json!({"original_line": {"$lte": 2}})))
        .await;
    assert_eq!(summary.deleted_count, 2);

    let summary = findings.delete_many(&tenant("other"), &Document::new()).await;
    assert_eq!(summary.deleted_count, 0);
}

#[tokio::test]
async fn test_repository_uniqueness() {
    let store = MemoryStore::new();
    let repositories = Repository::with_database(database(&store));

    let first = repositories.create(new_repository("123")).await.unwrap().unwrap();
    assert!(first.active);
    assert_eq!(first.repository_branch.as_deref(), Some("main"));
    assert_eq!(first.processing_status, "processing");

    assert_eq!(repositories.create(new_repository("123")).await, Ok(None));
    // The url is unique across tenants
    assert_eq!(repositories.create(new_repository("456")).await, Ok(None));

    let id = first.object_id.clone().unwrap();
    let stored = repositories.find_one(&tenant("123"), &id).await.unwrap().unwrap();
    assert_eq!(stored, first);
    assert_eq!(store.len("plexicus", Repository::COLLECTION).await, 1);
}

#[tokio::test]
async fn test_repository_create_from_document() {
    let store = MemoryStore::new();
    let repositories = Repository::with_database(database(&store));

    let missing_branch = doc(json!({
        "uri": "https://github.com/x/z",
        "client_id": "123",
        "type": "git_repository",
        "nickname": "x/z",
        "data": {}
    }));
    assert!(matches!(
        repositories.create_from_document(missing_branch).await,
        Err(EntityError::Validation(_))
    ));

    let mut payload = serde_json::to_value(new_repository("123")).unwrap();
    payload["github_oauth_token"] = json!("secret");
    let created = repositories
        .create_from_document(doc(payload))
        .await
        .unwrap()
        .unwrap();

    let raw = repositories
        .database()
        .find_one(
            Repository::COLLECTION,
            &tenant("123"),
            created.object_id.as_deref().unwrap(),
            None,
        )
        .await
        .unwrap();
    assert!(!raw.contains_key("github_oauth_token"));
    assert!(!raw.contains_key("uri"));
}

#[tokio::test]
async fn test_repository_update_and_delete() {
    let store = MemoryStore::new();
    let repositories = Repository::with_database(database(&store));
    let client = tenant("123");
    let id = repositories
        .create(new_repository("123"))
        .await
        .unwrap()
        .unwrap()
        .object_id
        .unwrap();

    let patch = RepositoryPatch {
        active: Some(false),
        ..Default::default()
    };
    let updated = repositories.update(&client, &id, &patch).await.unwrap().unwrap();
    assert!(!updated.active);
    assert_eq!(updated.alias, "x/y");

    let page = repositories
        .find_many(&client, &FindOptions::new().filter("active", false))
        .await
        .unwrap();
    assert_eq!(page.len(), 1);

    assert_eq!(repositories.delete(&tenant("456"), &id).await, Ok(None));
    assert!(repositories.delete(&client, &id).await.unwrap().is_some());
    assert_eq!(repositories.delete_many(&client, &Document::new()).await.deleted_count, 0);
}
