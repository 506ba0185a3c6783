//! Document store: JSON documents grouped into collections.
//!
//! The production store is a JSONB table keyed by `(collection, id)`. A batch
//! commit is one database transaction; `upsert` writes merge into the stored
//! document with `||`, other writes replace it.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::ident::{index_prefix, qualified_table};
use crate::models::{PendingWrite, StoredDocument};

#[derive(Error, Debug)]
pub enum DocumentStoreError {
    #[error("Invalid table identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected for {collection}/{id}: {reason}")]
    Rejected {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for DocumentStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => DocumentStoreError::PoolTimeout,
            other => DocumentStoreError::Database(other),
        }
    }
}

impl DocumentStoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            DocumentStoreError::PoolTimeout | DocumentStoreError::Unavailable(_) => true,
            DocumentStoreError::Database(e) => crate::db::is_transient(e),
            _ => false,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply all writes atomically.
    async fn commit_batch(&self, writes: &[PendingWrite]) -> Result<(), DocumentStoreError>;

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, DocumentStoreError>;

    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, DocumentStoreError>;

    /// Documents ordered by id.
    async fn fetch_page(
        &self,
        collection: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, DocumentStoreError>;

    async fn count(&self, collection: &str) -> Result<u64, DocumentStoreError>;
}

/// An open multi-document transaction. Dropping it without `commit` discards
/// the staged writes, but callers should `rollback` explicitly.
#[async_trait]
pub trait DocumentTransaction: Send {
    async fn set(&mut self, write: &PendingWrite) -> Result<(), DocumentStoreError>;

    async fn commit(self: Box<Self>) -> Result<(), DocumentStoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), DocumentStoreError>;
}

fn merge_into(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (k, v) in incoming {
        existing.insert(k.clone(), v.clone());
    }
}

// ============================================================================
// PgDocumentStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    table: String,
    raw_table: String,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, DocumentStoreError> {
        let quoted = qualified_table(table)
            .ok_or_else(|| DocumentStoreError::InvalidIdentifier(table.to_string()))?;
        Ok(Self {
            pool,
            table: quoted,
            raw_table: table.to_string(),
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), DocumentStoreError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (collection, id)
            )
            "#,
            table = self.table
        );
        sqlx::query(&sql).execute(&self.pool).await?;

        let idx = format!(
            "CREATE INDEX IF NOT EXISTS {prefix}_updated_at_idx ON {table} (collection, updated_at)",
            prefix = index_prefix(&self.raw_table),
            table = self.table
        );
        sqlx::query(&idx).execute(&self.pool).await?;
        Ok(())
    }

    fn write_sql(table: &str, upsert: bool) -> String {
        let update = if upsert {
            "d.data || EXCLUDED.data"
        } else {
            "EXCLUDED.data"
        };
        format!(
            r#"
            INSERT INTO {table} AS d (collection, id, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (collection, id) DO UPDATE
            SET data = {update}, updated_at = NOW()
            "#,
            table = table,
            update = update
        )
    }
}

async fn execute_write(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    write: &PendingWrite,
) -> Result<(), DocumentStoreError> {
    sqlx::query(&PgDocumentStore::write_sql(table, write.upsert))
        .bind(&write.collection)
        .bind(&write.doc_id)
        .bind(sqlx::types::Json(&write.data))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn commit_batch(&self, writes: &[PendingWrite]) -> Result<(), DocumentStoreError> {
        let mut tx = self.pool.begin().await?;
        for write in writes {
            execute_write(&mut tx, &self.table, write).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, DocumentStoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgDocumentTransaction {
            tx,
            table: self.table.clone(),
        }))
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, DocumentStoreError> {
        let sql = format!(
            "SELECT id, data FROM {} WHERE collection = $1 AND id = $2",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| stored_from_row(&r)).transpose()
    }

    async fn fetch_page(
        &self,
        collection: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, DocumentStoreError> {
        let sql = format!(
            "SELECT id, data FROM {} WHERE collection = $1 ORDER BY id OFFSET $2 LIMIT $3",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(collection)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn count(&self, collection: &str) -> Result<u64, DocumentStoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE collection = $1", self.table);
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn stored_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredDocument, DocumentStoreError> {
    let id: String = row.try_get("id")?;
    let data: Value = row.try_get("data")?;
    let data = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(StoredDocument { id, data })
}

pub struct PgDocumentTransaction {
    tx: Transaction<'static, Postgres>,
    table: String,
}

#[async_trait]
impl DocumentTransaction for PgDocumentTransaction {
    async fn set(&mut self, write: &PendingWrite) -> Result<(), DocumentStoreError> {
        execute_write(&mut self.tx, &self.table, write).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DocumentStoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DocumentStoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// MemoryDocumentStore
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    collections: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
    /// Sizes of successfully committed batches, in order.
    commit_log: Vec<usize>,
    failing_commits: u32,
    rejected_ids: HashSet<String>,
    rollbacks: u64,
}

impl MemoryInner {
    fn apply(&mut self, write: &PendingWrite) {
        let docs = self.collections.entry(write.collection.clone()).or_default();
        match docs.get_mut(&write.doc_id) {
            Some(existing) if write.upsert => merge_into(existing, &write.data),
            _ => {
                docs.insert(write.doc_id.clone(), write.data.clone());
            }
        }
    }

    fn check(&self, write: &PendingWrite) -> Result<(), DocumentStoreError> {
        if self.rejected_ids.contains(&write.doc_id) {
            return Err(DocumentStoreError::Rejected {
                collection: write.collection.clone(),
                id: write.doc_id.clone(),
                reason: "rejected by store".to_string(),
            });
        }
        Ok(())
    }
}

/// In-process document store for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` batch commits fail with a transient error.
    pub async fn fail_next_commits(&self, n: u32) {
        self.inner.lock().await.failing_commits = n;
    }

    /// Writes for `id` fail permanently, in batches and transactions.
    pub async fn reject_id(&self, id: impl Into<String>) {
        self.inner.lock().await.rejected_ids.insert(id.into());
    }

    pub async fn commit_log(&self) -> Vec<usize> {
        self.inner.lock().await.commit_log.clone()
    }

    pub async fn rollbacks(&self) -> u64 {
        self.inner.lock().await.rollbacks
    }

    pub async fn insert(&self, collection: &str, id: &str, data: Map<String, Value>) {
        self.inner
            .lock()
            .await
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn commit_batch(&self, writes: &[PendingWrite]) -> Result<(), DocumentStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(DocumentStoreError::Unavailable(
                "simulated commit failure".to_string(),
            ));
        }
        for write in writes {
            inner.check(write)?;
        }
        for write in writes {
            inner.apply(write);
        }
        inner.commit_log.push(writes.len());
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, DocumentStoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, DocumentStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|data| StoredDocument {
                id: id.to_string(),
                data: data.clone(),
            }))
    }

    async fn fetch_page(
        &self,
        collection: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, DocumentStoreError> {
        let inner = self.inner.lock().await;
        let Some(docs) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .skip(offset as usize)
            .take(limit)
            .map(|(id, data)| StoredDocument {
                id: id.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<u64, DocumentStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .collections
            .get(collection)
            .map_or(0, |docs| docs.len() as u64))
    }
}

struct MemoryTransaction {
    inner: Arc<Mutex<MemoryInner>>,
    staged: Vec<PendingWrite>,
}

#[async_trait]
impl DocumentTransaction for MemoryTransaction {
    async fn set(&mut self, write: &PendingWrite) -> Result<(), DocumentStoreError> {
        self.inner.lock().await.check(write)?;
        self.staged.push(write.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DocumentStoreError> {
        let mut inner = self.inner.lock().await;
        for write in &self.staged {
            inner.apply(write);
        }
        inner.commit_log.push(self.staged.len());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DocumentStoreError> {
        self.inner.lock().await.rollbacks += 1;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
