pub mod checkpoint;
pub mod document;
pub mod embedding;

pub use checkpoint::{MigrationCheckpoint, WriterCheckpoint, WriterStats};
pub use document::{PendingWrite, StoredDocument};
pub use embedding::{EmbeddingRecord, RecordKey, SearchFilters, SearchHit};
