//! End-to-end migration runs over in-memory stores and a mocked embedding API.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tandem_core::config::{ApiClientConfig, EmbeddingConfig, ProviderKind, SourceConfig};
use tandem_core::{
    ApiAuth, EmbeddingCache, EmbeddingService, HashEmbeddingProvider, MemoryDocumentStore,
    MemoryVectorStore, OpenAiEmbeddingProvider, RecordKey, ResilientApiClient, SearchFilters,
    VectorStore,
};
use tandem_sync::subsystems::migrate::{MigrationOptions, MigrationOrchestrator, MigrationOutcome};
use tandem_sync::subsystems::source::{create_source, JsonlSource};
use tandem_sync::subsystems::writer::BatchedDocumentWriter;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DIMS: usize = 16;

fn jsonl(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    for line in lines {
        writeln!(file, "{}", line).expect("write line");
    }
    file
}

fn hash_service() -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(
        Arc::new(HashEmbeddingProvider::new(DIMS)),
        EmbeddingCache::new(1000, Duration::from_secs(60)),
    ))
}

fn options(dir: &tempfile::TempDir, batch_size: usize) -> MigrationOptions {
    MigrationOptions {
        batch_size,
        concurrency: 4,
        upsert_batch_size: 2,
        checkpoint_path: dir.path().join("ckpt.json"),
        model_version: "v1".to_string(),
        chunk_type: "full".to_string(),
    }
}

#[tokio::test]
async fn test_jsonl_migration_then_search() {
    let file = jsonl(&[
        r#"{"id": "job-1", "text": "Senior Rust engineer building storage engines"}"#,
        r#"{"id": "job-2", "text": "Pastry chef for a busy bakery"}"#,
        r#"{"id": "job-3", "text": "Rust engineer for storage infrastructure", "chunk_type": "summary"}"#,
    ]);
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryVectorStore::new(DIMS));
    let embeddings = hash_service();

    let orch = MigrationOrchestrator::new(
        Arc::new(JsonlSource::new(file.path(), "id", "text")),
        Arc::clone(&embeddings),
        store.clone(),
        options(&dir, 2),
    );
    let (_tx, mut rx) = broadcast::channel(1);
    let report = orch.run(false, &mut rx).await.expect("migration run");

    assert_eq!(report.migrated, 3);
    assert_eq!(report.exit_code(), 0);

    let summary = store
        .get(&RecordKey::new("job-3", "v1", "summary"))
        .await
        .unwrap()
        .expect("summary chunk stored");
    assert_eq!(summary.metadata["provider"], "hash");

    let query = embeddings
        .generate("Senior Rust engineer building storage engines")
        .await
        .unwrap();
    assert!(query.cache_hit);

    let hits = store
        .similarity_search(&query.vector, 0.99, 5, &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(hits[0].id, "job-1");
}

#[tokio::test]
async fn test_source_change_is_reembedded() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryVectorStore::new(DIMS));

    let first = jsonl(&[r#"{"id": "a", "text": "one"}"#, r#"{"id": "b", "text": "two"}"#]);
    let orch = MigrationOrchestrator::new(
        Arc::new(JsonlSource::new(first.path(), "id", "text")),
        hash_service(),
        store.clone(),
        options(&dir, 10),
    );
    let (_tx, mut rx) = broadcast::channel(1);
    orch.run(false, &mut rx).await.unwrap();

    let second = jsonl(&[r#"{"id": "a", "text": "one"}"#, r#"{"id": "b", "text": "two, edited"}"#]);
    let orch = MigrationOrchestrator::new(
        Arc::new(JsonlSource::new(second.path(), "id", "text")),
        hash_service(),
        store.clone(),
        options(&dir, 10),
    );
    let report = orch.run(false, &mut rx).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.migrated, 1);
    assert_eq!(store.upsert_count(), 3);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_provider_outage_falls_back_and_trips_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let api = ApiClientConfig {
        max_concurrency: 2,
        max_retries: 1,
        backoff_base: 1,
        backoff_unit_ms: 1,
        max_backoff_secs: 1,
        request_timeout_secs: 5,
        circuit_breaker_threshold: 2,
        circuit_breaker_cooldown_secs: 600,
        rate_limit_rpm: 0,
    };
    let client = Arc::new(
        ResilientApiClient::new(server.uri(), ApiAuth::Bearer("sk-test".into()), api).unwrap(),
    );
    let provider = OpenAiEmbeddingProvider::new(Arc::clone(&client), "text-embedding-3-small", DIMS, 8);
    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(provider),
        EmbeddingCache::new(100, Duration::from_secs(60)),
    ));

    let file = jsonl(&[
        r#"{"id": "a", "text": "alpha"}"#,
        r#"{"id": "b", "text": "beta"}"#,
        r#"{"id": "c", "text": "gamma"}"#,
    ]);
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryVectorStore::new(DIMS));
    let mut opts = options(&dir, 10);
    opts.concurrency = 1;
    let orch = MigrationOrchestrator::new(
        Arc::new(JsonlSource::new(file.path(), "id", "text")),
        embeddings,
        store.clone(),
        opts,
    );

    let (_tx, mut rx) = broadcast::channel(1);
    let report = orch.run(false, &mut rx).await.unwrap();

    // Fallback vectors keep the migration going but are not counted as done.
    assert_eq!(report.migrated, 0);
    assert_eq!(report.degraded, vec!["a", "b", "c"]);
    assert!(report.failed.is_empty());
    let row = store
        .get(&RecordKey::new("a", "v1", "full"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.metadata["fallback"], true);

    // The first record's two attempts open the breaker; later records never
    // reach the server.
    assert!(client.circuit_state().open);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert!(client.stats().short_circuited >= 2);

    // Provider recovers: the next run replaces every fallback vector.
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{ "index": 0, "embedding": vec![0.25_f32; DIMS] }]
        })))
        .mount(&server)
        .await;
    client.reset_circuit();

    let report = orch.run(false, &mut rx).await.unwrap();
    assert_eq!(report.migrated, 3);
    assert_eq!(report.skipped, 0);
    assert!(report.degraded.is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let row = store
        .get(&RecordKey::new("a", "v1", "full"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.metadata["provider"], "openai");
    assert!(row.metadata.get("fallback").is_none());

    let report = orch.run(false, &mut rx).await.unwrap();
    assert_eq!(report.skipped, 3);
}

#[tokio::test]
async fn test_writer_output_feeds_document_source() {
    let documents = MemoryDocumentStore::new();
    let writer = BatchedDocumentWriter::new(
        Arc::new(documents.clone()),
        tandem_core::config::WriterConfig {
            collections: vec!["jobs".into()],
            batch_size: 2,
            ..Default::default()
        },
    )
    .unwrap();

    for (id, title) in [("j1", "Data Engineer"), ("j2", "ML Engineer"), ("j3", "SRE")] {
        let data = serde_json::json!({ "title": title, "skills": ["Python"] })
            .as_object()
            .cloned()
            .unwrap();
        writer.add("jobs", id, data, false).await.unwrap();
    }
    writer.close().await.unwrap();
    assert_eq!(documents.commit_log().await, vec![2, 1]);

    let source = create_source(
        &SourceConfig::Documents {
            collection: "jobs".into(),
            text_fields: vec!["title".into(), "skills".into()],
        },
        Some(Arc::new(documents.clone())),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryVectorStore::new(DIMS));
    let orch = MigrationOrchestrator::new(source, hash_service(), store.clone(), options(&dir, 2));
    let (_tx, mut rx) = broadcast::channel(1);
    let report = orch.run(false, &mut rx).await.unwrap();

    assert_eq!(report.migrated, 3);
    assert_eq!(report.outcome, MigrationOutcome::Completed);
    assert_eq!(store.stats().await.unwrap().by_model_version["v1"], 3);
}

#[test]
fn test_remote_provider_config_requires_key() {
    let config = EmbeddingConfig {
        provider: ProviderKind::Gemini,
        api_key_env: Some("TANDEM_INTEGRATION_UNSET_KEY".into()),
        ..Default::default()
    };
    assert!(tandem_core::create_provider(&config, &ApiClientConfig::default()).is_err());
}
