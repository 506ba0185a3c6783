//! Record sources for migration runs.
//!
//! A source is paged by offset. Paging must be stable between runs, since
//! the checkpoint stores the offset reached.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_core::checkpoint::resolve_path;
use tandem_core::config::SourceConfig;
use tandem_core::ident::is_safe_collection;
use tandem_core::{DocumentStore, DocumentStoreError};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::OnceCell;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Document source needs a document store")]
    MissingStore,

    #[error("Document store error: {0}")]
    Store(#[from] DocumentStoreError),
}

/// One record to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: String,
    pub text: String,
    /// Overrides the run's default chunk type.
    pub chunk_type: Option<String>,
    pub metadata: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            chunk_type: None,
            metadata: Map::new(),
        }
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn describe(&self) -> String;

    /// Up to `limit` records starting at `offset`. Fewer than `limit` means
    /// the source is exhausted.
    async fn fetch_page(&self, offset: u64, limit: usize)
        -> Result<Vec<SourceRecord>, SourceError>;
}

// ============================================================================
// DocumentSource
// ============================================================================

/// Pages a document-store collection; the embedding text is built from the
/// configured fields.
pub struct DocumentSource {
    store: Arc<dyn DocumentStore>,
    collection: String,
    text_fields: Vec<String>,
}

impl DocumentSource {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        text_fields: Vec<String>,
    ) -> Result<Self, SourceError> {
        let collection = collection.into();
        if !is_safe_collection(&collection) {
            return Err(SourceError::InvalidCollection(collection));
        }
        Ok(Self {
            store,
            collection,
            text_fields,
        })
    }

    fn field_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(Self::field_text).collect();
                (!parts.is_empty()).then(|| parts.join(", "))
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn build_text(&self, data: &Map<String, Value>) -> String {
        self.text_fields
            .iter()
            .filter_map(|field| data.get(field).and_then(Self::field_text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl RecordSource for DocumentSource {
    fn describe(&self) -> String {
        format!("documents:{}", self.collection)
    }

    async fn fetch_page(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let docs = self.store.fetch_page(&self.collection, offset, limit).await?;

        Ok(docs
            .into_iter()
            .map(|doc| {
                let mut metadata = Map::new();
                metadata.insert("collection".into(), Value::String(self.collection.clone()));
                let chunk_type = doc
                    .data
                    .get("chunk_type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                SourceRecord {
                    text: self.build_text(&doc.data),
                    id: doc.id,
                    chunk_type,
                    metadata,
                }
            })
            .collect())
    }
}

// ============================================================================
// JsonlSource
// ============================================================================

/// Start of a non-blank line.
#[derive(Debug, Clone, Copy)]
struct LineStart {
    byte: u64,
    line_no: u64,
}

/// Newline-delimited JSON objects. Blank lines are ignored and do not count
/// towards offsets.
///
/// The first read scans the file once and records where every record line
/// starts; pages then seek straight to their first line. The file must not
/// change while the source is in use.
pub struct JsonlSource {
    path: PathBuf,
    id_field: String,
    text_field: String,
    index: OnceCell<Vec<LineStart>>,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>, id_field: &str, text_field: &str) -> Self {
        Self {
            path: path.into(),
            id_field: id_field.to_string(),
            text_field: text_field.to_string(),
            index: OnceCell::new(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn open(&self) -> Result<BufReader<File>, SourceError> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(BufReader::new(file))
    }

    async fn build_index(&self) -> Result<Vec<LineStart>, SourceError> {
        let mut reader = self.open().await?;
        let mut index = Vec::new();
        let mut line = String::new();
        let mut byte = 0u64;
        let mut line_no = 0u64;

        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| self.io_error(e))?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if !line.trim().is_empty() {
                index.push(LineStart { byte, line_no });
            }
            byte += read as u64;
        }

        tracing::debug!(path = %self.path.display(), records = index.len(), "Indexed JSONL source");
        Ok(index)
    }

    /// Number of records in the file.
    pub async fn len(&self) -> Result<usize, SourceError> {
        Ok(self.line_index().await?.len())
    }

    async fn line_index(&self) -> Result<&[LineStart], SourceError> {
        let index = self.index.get_or_try_init(|| self.build_index()).await?;
        Ok(index.as_slice())
    }

    fn parse_line(&self, line_no: u64, line: &str) -> Result<SourceRecord, SourceError> {
        let malformed = |reason: String| SourceError::Malformed {
            line: line_no,
            reason,
        };

        let value: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(malformed("expected a JSON object".into()));
        };

        let id = match obj.remove(&self.id_field) {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(malformed(format!("missing {:?}", self.id_field))),
        };
        let text = match obj.remove(&self.text_field) {
            Some(Value::String(s)) => s,
            _ => return Err(malformed(format!("missing {:?}", self.text_field))),
        };
        let chunk_type = match obj.remove("chunk_type") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let metadata = match obj.remove("metadata") {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };

        Ok(SourceRecord {
            id,
            text,
            chunk_type,
            metadata,
        })
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    async fn fetch_page(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let index = self.line_index().await?;
        let start = (offset as usize).min(index.len());
        let wanted = &index[start..(start + limit).min(index.len())];
        let Some(first) = wanted.first() else {
            return Ok(Vec::new());
        };

        let mut reader = self.open().await?;
        reader
            .seek(SeekFrom::Start(first.byte))
            .await
            .map_err(|e| self.io_error(e))?;

        let mut records = Vec::with_capacity(wanted.len());
        let mut line = String::new();
        for entry in wanted {
            // Blank lines between records are not indexed; skip past them.
            loop {
                line.clear();
                let read = reader
                    .read_line(&mut line)
                    .await
                    .map_err(|e| self.io_error(e))?;
                if read == 0 {
                    return Err(SourceError::Malformed {
                        line: entry.line_no,
                        reason: "file shrank while reading".into(),
                    });
                }
                if !line.trim().is_empty() {
                    break;
                }
            }
            records.push(self.parse_line(entry.line_no, line.trim_end_matches(['\n', '\r']))?);
        }
        Ok(records)
    }
}

/// Build the configured source.
pub fn create_source(
    config: &SourceConfig,
    store: Option<Arc<dyn DocumentStore>>,
) -> Result<Arc<dyn RecordSource>, SourceError> {
    match config {
        SourceConfig::Documents {
            collection,
            text_fields,
        } => {
            let store = store.ok_or(SourceError::MissingStore)?;
            Ok(Arc::new(DocumentSource::new(
                store,
                collection.clone(),
                text_fields.clone(),
            )?))
        }
        SourceConfig::Jsonl {
            path,
            id_field,
            text_field,
        } => Ok(Arc::new(JsonlSource::new(
            resolve_path(path),
            id_field,
            text_field,
        ))),
    }
}
