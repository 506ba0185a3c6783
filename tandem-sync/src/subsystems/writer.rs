//! Batched document writer.
//!
//! Each registered collection has its own buffer. A buffer flushes itself
//! when it reaches `batch_size` documents or `max_batch_bytes` serialized
//! bytes. A failed flush retries with exponential backoff; when retries are
//! exhausted the batch goes back to the front of its buffer, and writes that
//! have been re-queued `max_requeues` times move to the failure bucket.

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tandem_core::checkpoint::{self, resolve_path, CheckpointError};
use tandem_core::config::WriterConfig;
use tandem_core::ident::is_safe_collection;
use tandem_core::models::{WriterCheckpoint, WriterStats};
use tandem_core::{DocumentStore, DocumentStoreError, PendingWrite};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Invalid or unregistered collection: {0:?}")]
    InvalidCollection(String),

    #[error("Writer is closed")]
    Closed,

    #[error("Transaction on {collection} rolled back: {source}")]
    Transaction {
        collection: String,
        #[source]
        source: DocumentStoreError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub written: usize,
    pub requeued: usize,
    /// Moved to the failure bucket by this flush.
    pub dropped: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.written += other.written;
        self.requeued += other.requeued;
        self.dropped += other.dropped;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOutcome {
    /// The add triggered a flush that committed this document.
    pub written_immediately: bool,
    pub flush: Option<FlushReport>,
}

#[derive(Debug, Default)]
struct CollectionBuffer {
    writes: VecDeque<PendingWrite>,
    bytes: usize,
}

impl CollectionBuffer {
    fn push_back(&mut self, write: PendingWrite) {
        self.bytes += write.approx_bytes();
        self.writes.push_back(write);
    }

    /// Take the next batch, bounded by count and bytes. Always takes at
    /// least one write so an oversized document still makes progress.
    fn take_batch(&mut self, max_docs: usize, max_bytes: usize) -> Vec<PendingWrite> {
        let mut batch = Vec::new();
        let mut bytes = 0;
        while let Some(next) = self.writes.front() {
            let size = next.approx_bytes();
            if !batch.is_empty() && (batch.len() >= max_docs || bytes + size > max_bytes) {
                break;
            }
            bytes += size;
            if let Some(write) = self.writes.pop_front() {
                batch.push(write);
            }
        }
        self.bytes = self.bytes.saturating_sub(bytes);
        batch
    }

    fn requeue_front(&mut self, writes: Vec<PendingWrite>) {
        for write in writes.into_iter().rev() {
            self.bytes += write.approx_bytes();
            self.writes.push_front(write);
        }
    }
}

pub struct BatchedDocumentWriter {
    store: Arc<dyn DocumentStore>,
    config: WriterConfig,
    buffers: Mutex<HashMap<String, CollectionBuffer>>,
    failed: Mutex<Vec<PendingWrite>>,
    stats: Mutex<WriterStats>,
    checkpoint_path: PathBuf,
    closed: AtomicBool,
}

impl BatchedDocumentWriter {
    /// Validates every configured collection name up front.
    pub fn new(store: Arc<dyn DocumentStore>, config: WriterConfig) -> Result<Self, WriterError> {
        let mut buffers = HashMap::new();
        for collection in &config.collections {
            if !is_safe_collection(collection) {
                return Err(WriterError::InvalidCollection(collection.clone()));
            }
            buffers.insert(collection.clone(), CollectionBuffer::default());
        }

        Ok(Self {
            store,
            checkpoint_path: resolve_path(&config.checkpoint_path),
            config,
            buffers: Mutex::new(buffers),
            failed: Mutex::new(Vec::new()),
            stats: Mutex::new(WriterStats::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    fn ensure_open(&self) -> Result<(), WriterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriterError::Closed);
        }
        Ok(())
    }

    fn ensure_registered(&self, collection: &str) -> Result<(), WriterError> {
        if self.config.collections.iter().any(|c| c == collection) {
            Ok(())
        } else {
            Err(WriterError::InvalidCollection(collection.to_string()))
        }
    }

    /// Buffer one document, flushing the collection if a threshold is hit.
    pub async fn add(
        &self,
        collection: &str,
        doc_id: &str,
        mut data: Map<String, Value>,
        upsert: bool,
    ) -> Result<AddOutcome, WriterError> {
        self.ensure_open()?;
        self.ensure_registered(collection)?;
        add_search_fields(&mut data);

        let write = PendingWrite {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            data,
            upsert,
            attempts: 0,
        };

        let should_flush = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(collection.to_string()).or_default();
            buffer.push_back(write);
            buffer.writes.len() >= self.config.batch_size
                || buffer.bytes >= self.config.max_batch_bytes
        };
        self.stats.lock().await.added += 1;

        if !should_flush {
            return Ok(AddOutcome::default());
        }

        tracing::debug!(collection, "Buffer threshold reached, flushing");
        let report = self.flush(collection).await?;
        Ok(AddOutcome {
            written_immediately: report.written > 0 && report.requeued == 0,
            flush: Some(report),
        })
    }

    /// Commit everything buffered for `collection`, one batch at a time.
    /// Stops at the first batch that exhausts its retries.
    pub async fn flush(&self, collection: &str) -> Result<FlushReport, WriterError> {
        self.ensure_registered(collection)?;
        let mut report = FlushReport::default();

        loop {
            let batch = {
                let mut buffers = self.buffers.lock().await;
                match buffers.get_mut(collection) {
                    Some(buffer) => {
                        buffer.take_batch(self.config.batch_size.max(1), self.config.max_batch_bytes)
                    }
                    None => Vec::new(),
                }
            };
            if batch.is_empty() {
                break;
            }

            let outcome = self.commit_with_retry(collection, batch).await;
            let stop = outcome.requeued > 0;
            report.absorb(outcome);
            if stop {
                break;
            }
        }

        Ok(report)
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.config.backoff_base.max(1))
            .factor(self.config.backoff_unit_ms.max(1))
            .take(self.config.max_retries as usize)
    }

    async fn commit_with_retry(&self, collection: &str, batch: Vec<PendingWrite>) -> FlushReport {
        let attempts = AtomicU32::new(0);
        let result = RetryIf::start(
            self.backoff(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.store.commit_batch(&batch)
            },
            |e: &DocumentStoreError| {
                if e.is_transient() {
                    tracing::warn!(collection, error = %e, "Batch commit failed, retrying");
                    true
                } else {
                    false
                }
            },
        )
        .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1) as u64;
        let mut stats = self.stats.lock().await;
        stats.retries += retries;

        match result {
            Ok(()) => {
                stats.written += batch.len() as u64;
                stats.flushes += 1;
                tracing::debug!(collection, count = batch.len(), "Batch committed");
                FlushReport {
                    written: batch.len(),
                    ..Default::default()
                }
            }
            Err(e) => {
                tracing::error!(
                    collection,
                    count = batch.len(),
                    error = %e,
                    "Batch commit failed after retries"
                );
                stats.failed_writes += batch.len() as u64;

                let (dropped, requeue): (Vec<_>, Vec<_>) = batch
                    .into_iter()
                    .map(|mut w| {
                        w.attempts += 1;
                        w
                    })
                    .partition(|w| w.attempts >= self.config.max_requeues);
                stats.dropped_writes += dropped.len() as u64;
                drop(stats);

                let report = FlushReport {
                    written: 0,
                    requeued: requeue.len(),
                    dropped: dropped.len(),
                };
                if !dropped.is_empty() {
                    tracing::error!(
                        collection,
                        count = dropped.len(),
                        "Writes moved to failure bucket"
                    );
                    self.failed.lock().await.extend(dropped);
                }
                if !requeue.is_empty() {
                    let mut buffers = self.buffers.lock().await;
                    buffers
                        .entry(collection.to_string())
                        .or_default()
                        .requeue_front(requeue);
                }
                report
            }
        }
    }

    pub async fn flush_all(&self) -> Result<FlushReport, WriterError> {
        let mut report = FlushReport::default();
        for collection in &self.config.collections {
            report.absorb(self.flush(collection).await?);
        }
        Ok(report)
    }

    /// Flush everything and refuse further adds.
    pub async fn close(&self) -> Result<WriterStats, WriterError> {
        let report = self.flush_all().await?;
        self.closed.store(true, Ordering::SeqCst);
        let stats = self.stats().await;
        let failed = self.failed.lock().await.len();
        tracing::info!(
            written = stats.written,
            pending = report.requeued,
            failed,
            "Document writer closed"
        );
        Ok(stats)
    }

    /// Write all documents or none. The transaction is rolled back
    /// explicitly before any error is returned. Existing documents are
    /// replaced.
    pub async fn write_transactional(
        &self,
        collection: &str,
        docs: Vec<(String, Map<String, Value>)>,
    ) -> Result<usize, WriterError> {
        self.ensure_open()?;
        self.ensure_registered(collection)?;

        let tx_err = |source| WriterError::Transaction {
            collection: collection.to_string(),
            source,
        };

        let mut tx = self.store.begin().await.map_err(tx_err)?;
        let count = docs.len();

        for (doc_id, mut data) in docs {
            add_search_fields(&mut data);
            let write = PendingWrite {
                collection: collection.to_string(),
                doc_id,
                data,
                upsert: false,
                attempts: 0,
            };
            if let Err(e) = tx.set(&write).await {
                tracing::warn!(collection, doc_id = %write.doc_id, error = %e, "Rolling back transaction");
                if let Err(rb) = tx.rollback().await {
                    tracing::error!(collection, error = %rb, "Rollback failed");
                }
                self.stats.lock().await.rollbacks += 1;
                return Err(tx_err(e));
            }
        }

        match tx.commit().await {
            Ok(()) => {
                let mut stats = self.stats.lock().await;
                stats.transactions += 1;
                stats.written += count as u64;
                Ok(count)
            }
            Err(e) => {
                self.stats.lock().await.rollbacks += 1;
                Err(tx_err(e))
            }
        }
    }

    pub async fn pending(&self, collection: &str) -> usize {
        self.buffers
            .lock()
            .await
            .get(collection)
            .map_or(0, |b| b.writes.len())
    }

    /// Writes that exhausted every re-queue.
    pub async fn failed_writes(&self) -> Vec<PendingWrite> {
        self.failed.lock().await.clone()
    }

    pub async fn stats(&self) -> WriterStats {
        self.stats.lock().await.clone()
    }

    pub async fn save_checkpoint(&self, last_id: &str, extra: Value) -> Result<(), WriterError> {
        let ckpt = WriterCheckpoint {
            last_processed_id: last_id.to_string(),
            timestamp: Utc::now(),
            stats: self.stats().await,
            extra,
        };
        checkpoint::save_json(&self.checkpoint_path, &ckpt)?;
        tracing::debug!(last_id, path = %self.checkpoint_path.display(), "Writer checkpoint saved");
        Ok(())
    }

    pub async fn load_checkpoint(&self) -> Result<Option<WriterCheckpoint>, WriterError> {
        Ok(checkpoint::load_json(&self.checkpoint_path)?)
    }
}

// ============================================================================
// Search fields
// ============================================================================

fn keyword_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[\p{L}\p{N}+#]+(?:\.[\p{L}\p{N}]+)*").expect("valid regex")
    })
}

fn first_str<'a>(data: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| data.get(*k).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

/// Adds the lower-cased search fields derived from `name`/`title`,
/// `skills` and `level`/`seniority`.
pub fn add_search_fields(data: &mut Map<String, Value>) {
    let mut keywords = BTreeSet::new();
    let mut collect = |text: &str| {
        for m in keyword_pattern().find_iter(&text.to_lowercase()) {
            keywords.insert(m.as_str().to_string());
        }
    };

    let name = first_str(data, &["name", "title"]).map(|s| s.trim().to_lowercase());
    let level = first_str(data, &["level", "seniority"]).map(|s| s.trim().to_lowercase());
    let skills: Option<Vec<String>> = match data.get("skills") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        Some(Value::String(s)) => Some(
            s.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        _ => None,
    };

    if let Some(name) = &name {
        collect(name);
    }
    if let Some(level) = &level {
        collect(level);
    }
    if let Some(skills) = &skills {
        skills.iter().for_each(|s| collect(s));
    }

    if let Some(name) = name {
        data.insert("name_lower".into(), Value::String(name));
    }
    if let Some(level) = level {
        data.insert("level_lower".into(), Value::String(level));
    }
    if let Some(skills) = skills {
        data.insert(
            "skills_lower".into(),
            Value::Array(skills.into_iter().map(Value::String).collect()),
        );
    }
    if !keywords.is_empty() {
        data.insert(
            "search_keywords".into(),
            Value::Array(keywords.into_iter().map(Value::String).collect()),
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
