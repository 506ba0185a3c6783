use thiserror::Error;

use crate::api_client::ApiError;
use crate::checkpoint::CheckpointError;
use crate::documents::DocumentStoreError;
use crate::embeddings::EmbeddingError;
use crate::vector_store::VectorStoreError;

#[derive(Error, Debug)]
pub enum TandemError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("Document store error: {0}")]
    DocumentStore(#[from] DocumentStoreError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Other error: {0}")]
    Other(String),
}
