//! Migration orchestrator
//!
//! Pages through a [`RecordSource`], embeds every record whose content
//! checksum changed since the last run, and upserts it into the vector
//! store. The checkpoint is persisted after every batch, before the offset
//! advances, so a crash or Ctrl-C resumes where it stopped without
//! duplicating or skipping records.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::checkpoint::{self, resolve_path, CheckpointError};
use tandem_core::config::{MigrationConfig, VectorStoreConfig};
use tandem_core::models::MigrationCheckpoint;
use tandem_core::{EmbeddingRecord, EmbeddingService, VectorStore};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

use super::source::{RecordSource, SourceError, SourceRecord};

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Embedding dimensions {embedding} do not match vector store dimensions {store}")]
    DimensionConfig { embedding: usize, store: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub considered: u64,
    /// Upserted, or in a dry run, validated and ready to upsert.
    pub migrated: u64,
    /// Upserted with a fallback vector; embedded again on the next run.
    pub degraded: Vec<String>,
    pub skipped: u64,
    pub failed: BTreeMap<String, String>,
    pub last_offset: u64,
    pub outcome: MigrationOutcome,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

impl MigrationReport {
    /// 0 clean, 1 completed with failures, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            MigrationOutcome::Cancelled => 130,
            MigrationOutcome::Completed if !self.failed.is_empty() => 1,
            MigrationOutcome::Completed => 0,
        }
    }
}

/// Exit code for errors that abort a run.
pub const FATAL_EXIT_CODE: i32 = 2;

/// Content checksum of what gets embedded and stored.
///
/// `serde_json::Map` keeps keys sorted, so the serialization is canonical.
pub fn checksum(text: &str, chunk_type: &str, metadata: &Map<String, Value>) -> String {
    let canonical = json!({
        "text": text,
        "chunk_type": chunk_type,
        "metadata": metadata,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Rows per vector store transaction when a batch is written.
    pub upsert_batch_size: usize,
    pub checkpoint_path: PathBuf,
    pub model_version: String,
    pub chunk_type: String,
}

impl MigrationOptions {
    pub fn from_config(config: &MigrationConfig, store: &VectorStoreConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            upsert_batch_size: store.upsert_batch_size.max(1),
            concurrency: if config.concurrency == 0 {
                num_cpus::get()
            } else {
                config.concurrency
            },
            checkpoint_path: resolve_path(&config.checkpoint_path),
            model_version: config.model_version.clone(),
            chunk_type: config.chunk_type.clone(),
        }
    }
}

enum RecordResult {
    Migrated { id: String, checksum: String },
    Degraded { id: String, checksum: String },
    Failed { id: String, error: String },
}

/// An embedded record waiting to be written.
struct PreparedRow {
    row: EmbeddingRecord,
    checksum: String,
    fallback: bool,
}

enum Prepared {
    Write(PreparedRow),
    Done(RecordResult),
}

pub struct MigrationOrchestrator {
    source: Arc<dyn RecordSource>,
    embeddings: Arc<EmbeddingService>,
    store: Arc<dyn VectorStore>,
    options: MigrationOptions,
}

impl MigrationOrchestrator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        embeddings: Arc<EmbeddingService>,
        store: Arc<dyn VectorStore>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            embeddings,
            store,
            options,
        }
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Delete the checkpoint so the next run starts from scratch.
    pub fn reset_checkpoint(&self) -> Result<bool, MigrationError> {
        let removed = checkpoint::remove(&self.options.checkpoint_path)?;
        if removed {
            tracing::info!(path = %self.options.checkpoint_path.display(), "Migration checkpoint reset");
        }
        Ok(removed)
    }

    pub fn load_checkpoint(&self) -> Result<MigrationCheckpoint, MigrationError> {
        Ok(checkpoint::load_json(&self.options.checkpoint_path)?.unwrap_or_default())
    }

    /// Run until the source is exhausted or `shutdown` fires.
    ///
    /// Cancellation is checked between batches; the batch in progress
    /// finishes and its checkpoint is written before returning.
    pub async fn run(
        &self,
        dry_run: bool,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<MigrationReport, MigrationError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();

        if self.embeddings.dimensions() != self.store.dimensions() {
            return Err(MigrationError::DimensionConfig {
                embedding: self.embeddings.dimensions(),
                store: self.store.dimensions(),
            });
        }

        let mut ckpt = self.load_checkpoint()?;
        let mut offset = ckpt.resume_offset();
        ckpt.completed = false;

        tracing::info!(
            %run_id,
            source = %self.source.describe(),
            offset,
            dry_run,
            batch_size = self.options.batch_size,
            concurrency = self.options.concurrency,
            "Migration started"
        );

        let mut report = MigrationReport {
            run_id,
            dry_run,
            considered: 0,
            migrated: 0,
            degraded: Vec::new(),
            skipped: 0,
            failed: BTreeMap::new(),
            last_offset: offset,
            outcome: MigrationOutcome::Completed,
            duration: Duration::ZERO,
        };

        loop {
            if cancelled(shutdown) {
                tracing::info!(%run_id, offset, "Migration cancelled");
                report.outcome = MigrationOutcome::Cancelled;
                break;
            }

            let page = self
                .source
                .fetch_page(offset, self.options.batch_size)
                .await?;
            let exhausted = page.len() < self.options.batch_size;
            let page_len = page.len() as u64;

            if page_len > 0 {
                self.process_batch(page, dry_run, &mut ckpt, &mut report)
                    .await;
            }

            offset += page_len;
            ckpt.last_offset = offset;
            ckpt.completed = exhausted;
            if !dry_run {
                checkpoint::save_json(&self.options.checkpoint_path, &ckpt)?;
            }
            report.last_offset = offset;

            tracing::debug!(
                %run_id,
                offset,
                migrated = report.migrated,
                skipped = report.skipped,
                failed = report.failed.len(),
                "Batch complete"
            );

            if exhausted {
                break;
            }
        }

        report.degraded.sort();
        report.duration = started.elapsed();
        tracing::info!(
            %run_id,
            considered = report.considered,
            migrated = report.migrated,
            degraded = report.degraded.len(),
            skipped = report.skipped,
            failed = report.failed.len(),
            last_offset = report.last_offset,
            outcome = ?report.outcome,
            duration_ms = report.duration.as_millis() as u64,
            "Migration finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        page: Vec<SourceRecord>,
        dry_run: bool,
        ckpt: &mut MigrationCheckpoint,
        report: &mut MigrationReport,
    ) {
        let mut pending = Vec::new();
        for record in page {
            report.considered += 1;
            let chunk_type = record
                .chunk_type
                .clone()
                .unwrap_or_else(|| self.options.chunk_type.clone());
            let sum = checksum(&record.text, &chunk_type, &record.metadata);
            if ckpt.is_unchanged(&record.id, &sum) {
                report.skipped += 1;
                continue;
            }
            pending.push((record, chunk_type, sum));
        }

        let prepared: Vec<Prepared> = stream::iter(pending)
            .map(|(record, chunk_type, sum)| self.prepare_record(record, chunk_type, sum, dry_run))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut results = Vec::with_capacity(prepared.len());
        let mut writes = Vec::new();
        for p in prepared {
            match p {
                Prepared::Write(row) => writes.push(row),
                Prepared::Done(result) => results.push(result),
            }
        }
        results.extend(self.write_rows(writes).await);

        for result in results {
            match result {
                RecordResult::Migrated { id, checksum } => {
                    report.migrated += 1;
                    ckpt.record_migrated(&id, &checksum);
                }
                RecordResult::Degraded { id, checksum } => {
                    ckpt.record_degraded(&id, &checksum);
                    report.degraded.push(id);
                }
                RecordResult::Failed { id, error } => {
                    ckpt.record_failed(&id, &error);
                    report.failed.insert(id, error);
                }
            }
        }
    }

    async fn prepare_record(
        &self,
        record: SourceRecord,
        chunk_type: String,
        checksum: String,
        dry_run: bool,
    ) -> Prepared {
        let id = record.id.clone();
        let failed = |error: String| {
            tracing::warn!(id = %id, error = %error, "Record failed");
            Prepared::Done(RecordResult::Failed {
                id: id.clone(),
                error,
            })
        };

        if record.id.trim().is_empty() {
            return failed("record id is empty".to_string());
        }
        if record.text.trim().is_empty() {
            return failed("record text is empty".to_string());
        }
        if dry_run {
            return Prepared::Done(RecordResult::Migrated {
                id: record.id,
                checksum,
            });
        }

        let generated = match self.embeddings.generate(&record.text).await {
            Ok(g) => g,
            Err(e) => return failed(format!("embedding failed: {}", e)),
        };

        let mut metadata = record.metadata;
        metadata.insert("checksum".into(), Value::String(checksum.clone()));
        metadata.insert("provider".into(), Value::String(generated.provider.clone()));
        metadata.insert("model".into(), Value::String(generated.model.clone()));
        if generated.fallback {
            metadata.insert("fallback".into(), Value::Bool(true));
        }

        tracing::trace!(id = %record.id, cache_hit = generated.cache_hit, "Record embedded");
        let row = EmbeddingRecord::new(
            record.id,
            generated.vector,
            self.options.model_version.clone(),
            chunk_type,
        )
        .with_metadata(metadata);

        Prepared::Write(PreparedRow {
            row,
            checksum,
            fallback: generated.fallback,
        })
    }

    /// Bulk upsert in `upsert_batch_size` transactions. Rows the bulk path
    /// did not commit are written one by one so a bad row only fails itself.
    async fn write_rows(&self, writes: Vec<PreparedRow>) -> Vec<RecordResult> {
        if writes.is_empty() {
            return Vec::new();
        }

        let rows: Vec<EmbeddingRecord> = writes.iter().map(|w| w.row.clone()).collect();
        let committed: HashSet<String> = match self
            .store
            .batch_upsert(&rows, self.options.upsert_batch_size)
            .await
        {
            Ok(report) => {
                if let Some(e) = &report.error {
                    tracing::warn!(
                        committed = report.committed_ids.len(),
                        uncommitted = report.uncommitted_ids.len(),
                        error = %e,
                        "Bulk upsert stopped early, writing remaining rows individually"
                    );
                }
                report.committed_ids.into_iter().collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bulk upsert rejected, writing rows individually");
                HashSet::new()
            }
        };

        stream::iter(writes)
            .map(|w| {
                let done = committed.contains(&w.row.id);
                async move {
                    if !done {
                        if let Err(e) = self.store.upsert(&w.row).await {
                            let error = format!("upsert failed: {}", e);
                            tracing::warn!(id = %w.row.id, error = %error, "Record failed");
                            return RecordResult::Failed {
                                id: w.row.id,
                                error,
                            };
                        }
                    }
                    if w.fallback {
                        tracing::warn!(id = %w.row.id, "Record stored with fallback vector");
                        RecordResult::Degraded {
                            id: w.row.id,
                            checksum: w.checksum,
                        }
                    } else {
                        tracing::debug!(id = %w.row.id, "Record migrated");
                        RecordResult::Migrated {
                            id: w.row.id,
                            checksum: w.checksum,
                        }
                    }
                }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await
    }
}

/// Non-blocking check of the shutdown channel. A dropped sender is not a
/// cancellation.
fn cancelled(shutdown: &mut broadcast::Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tandem_core::{EmbeddingCache, HashEmbeddingProvider, MemoryVectorStore};

    const DIMS: usize = 8;

    struct VecSource {
        records: Vec<SourceRecord>,
        fetches: AtomicUsize,
    }

    impl VecSource {
        fn new(ids: &[&str]) -> Self {
            Self {
                records: ids
                    .iter()
                    .map(|id| SourceRecord::new(*id, format!("text for {}", id)))
                    .collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordSource for VecSource {
        fn describe(&self) -> String {
            "vec".into()
        }

        async fn fetch_page(
            &self,
            offset: u64,
            limit: usize,
        ) -> Result<Vec<SourceRecord>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .records
                .iter()
                .skip(offset as usize)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    /// Fires the shutdown channel while serving its first page.
    struct SignallingSource {
        inner: VecSource,
        shutdown: std::sync::Mutex<Option<broadcast::Sender<()>>>,
    }

    #[async_trait]
    impl RecordSource for SignallingSource {
        fn describe(&self) -> String {
            "signalling".into()
        }

        async fn fetch_page(
            &self,
            offset: u64,
            limit: usize,
        ) -> Result<Vec<SourceRecord>, SourceError> {
            if let Some(tx) = self.shutdown.lock().unwrap().take() {
                tx.send(()).unwrap();
            }
            self.inner.fetch_page(offset, limit).await
        }
    }

    fn service() -> Arc<EmbeddingService> {
        Arc::new(EmbeddingService::new(
            Arc::new(HashEmbeddingProvider::new(DIMS)),
            EmbeddingCache::new(1000, Duration::from_secs(60)),
        ))
    }

    fn options(dir: &tempfile::TempDir, batch_size: usize) -> MigrationOptions {
        MigrationOptions {
            batch_size,
            concurrency: 2,
            upsert_batch_size: 100,
            checkpoint_path: dir.path().join("migration.json"),
            model_version: "v1".into(),
            chunk_type: "full".into(),
        }
    }

    fn orchestrator(
        source: Arc<VecSource>,
        store: Arc<MemoryVectorStore>,
        opts: MigrationOptions,
    ) -> MigrationOrchestrator {
        MigrationOrchestrator::new(source, service(), store, opts)
    }

    fn idle_shutdown() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
        broadcast::channel(1)
    }

    #[tokio::test]
    async fn test_five_records_one_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir, 2);

        let source = Arc::new(VecSource::new(&["r1", "r2", "r3", "r4", "r5"]));
        let mut seeded = MigrationCheckpoint::default();
        seeded.record_migrated("r3", &checksum("text for r3", "full", &Map::new()));
        checkpoint::save_json(&opts.checkpoint_path, &seeded).unwrap();

        let store = Arc::new(MemoryVectorStore::new(DIMS));
        let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), opts);
        let (_tx, mut rx) = idle_shutdown();

        let report = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(report.migrated, 4);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.last_offset, 5);
        assert_eq!(report.outcome, MigrationOutcome::Completed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(store.upsert_count(), 4);

        let ckpt = orch.load_checkpoint().unwrap();
        assert_eq!(ckpt.last_offset, 5);
        assert_eq!(ckpt.migrated.len(), 5);
    }

    #[tokio::test]
    async fn test_rerun_without_changes_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(VecSource::new(&["a", "b", "c"]));
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), options(&dir, 2));
        let (_tx, mut rx) = idle_shutdown();

        orch.run(false, &mut rx).await.unwrap();
        let second = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(store.upsert_count(), 3);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_cancel_then_resume_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let ids = ["a", "b", "c", "d", "e", "f"];
        let source = Arc::new(VecSource::new(&ids));
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), options(&dir, 2));

        // Shutdown already signalled: nothing runs, checkpoint untouched.
        let (tx, mut rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        let report = orch.run(false, &mut rx).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::Cancelled);
        assert_eq!(report.exit_code(), 130);
        assert_eq!(report.considered, 0);

        // Simulate a crash after the first batch by seeding the checkpoint.
        let mut ckpt = MigrationCheckpoint {
            last_offset: 2,
            ..Default::default()
        };
        for id in &ids[..2] {
            ckpt.record_migrated(id, &checksum(&format!("text for {}", id), "full", &Map::new()));
        }
        checkpoint::save_json(&orch.options().checkpoint_path, &ckpt).unwrap();

        let (_tx, mut rx) = idle_shutdown();
        let report = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(report.considered, 4);
        assert_eq!(report.migrated, 4);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.last_offset, 6);
        assert_eq!(store.upsert_count(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_finishes_batch_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let ids = ["a", "b", "c", "d", "e", "f"];
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        let (tx, mut rx) = broadcast::channel(1);
        let source = Arc::new(SignallingSource {
            inner: VecSource::new(&ids),
            shutdown: std::sync::Mutex::new(Some(tx)),
        });
        let orch = MigrationOrchestrator::new(
            source,
            service(),
            Arc::clone(&store) as Arc<dyn VectorStore>,
            options(&dir, 2),
        );

        let report = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(report.outcome, MigrationOutcome::Cancelled);
        assert_eq!(report.exit_code(), 130);
        assert_eq!(report.considered, 2);
        assert_eq!(report.migrated, 2);
        assert_eq!(report.last_offset, 2);
        assert_eq!(store.upsert_count(), 2);

        let ckpt = orch.load_checkpoint().unwrap();
        assert_eq!(ckpt.last_offset, 2);
        assert!(!ckpt.completed);
        assert_eq!(ckpt.migrated.len(), 2);

        let (_tx, mut rx) = idle_shutdown();
        let resumed = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(resumed.outcome, MigrationOutcome::Completed);
        assert_eq!(resumed.considered, 4);
        assert_eq!(resumed.migrated, 4);
        assert_eq!(resumed.skipped, 0);
        assert_eq!(resumed.last_offset, 6);
        assert_eq!(store.upsert_count(), 6);
        assert_eq!(store.len().await, 6);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(VecSource::new(&["a", "b", "c"]));
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        store.fail_writes_for("b").await;
        let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), options(&dir, 10));
        let (_tx, mut rx) = idle_shutdown();

        let report = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(report.migrated, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed["b"].contains("upsert failed"));
        assert_eq!(report.exit_code(), 1);

        // Failed records are retried on the next run once the store recovers.
        store.clear_failures().await;
        let report = orch.run(false, &mut rx).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 2);
        assert!(orch.load_checkpoint().unwrap().failed.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_write_failure_falls_back_to_single_rows() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(VecSource::new(&["a", "b", "c", "d", "e"]));
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        store.fail_writes_for("c").await;
        let mut opts = options(&dir, 10);
        opts.upsert_batch_size = 2;
        let orch = orchestrator(source, Arc::clone(&store), opts);
        let (_tx, mut rx) = idle_shutdown();

        let report = orch.run(false, &mut rx).await.unwrap();

        assert_eq!(report.migrated, 4);
        assert_eq!(report.failed.keys().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(store.upsert_count(), 4);
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(VecSource::new(&["a", "b", "c"]));
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), options(&dir, 2));
        let (_tx, mut rx) = idle_shutdown();

        let report = orch.run(true, &mut rx).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.migrated, 3);
        assert!(store.is_empty().await);
        assert!(!orch.options().checkpoint_path.exists());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let orch = MigrationOrchestrator::new(
            Arc::new(VecSource::new(&["a"])),
            service(),
            Arc::new(MemoryVectorStore::new(DIMS + 1)),
            options(&dir, 2),
        );
        let (_tx, mut rx) = idle_shutdown();

        assert!(matches!(
            orch.run(false, &mut rx).await,
            Err(MigrationError::DimensionConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_clears_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(VecSource::new(&["a"]));
        let store = Arc::new(MemoryVectorStore::new(DIMS));
        let orch = orchestrator(source, Arc::clone(&store), options(&dir, 2));
        let (_tx, mut rx) = idle_shutdown();

        orch.run(false, &mut rx).await.unwrap();
        assert!(orch.reset_checkpoint().unwrap());

        let report = orch.run(false, &mut rx).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(store.upsert_count(), 2);
    }

    #[test]
    fn test_checksum_ignores_key_order_and_tracks_content() {
        let a: Map<String, Value> = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Map<String, Value> = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();

        assert_eq!(checksum("t", "full", &a), checksum("t", "full", &b));
        assert_ne!(checksum("t", "full", &a), checksum("t2", "full", &a));
        assert_ne!(checksum("t", "full", &a), checksum("t", "title", &a));
    }
}
