pub mod api_client;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod documents;
pub mod embeddings;
pub mod error;
pub mod ident;
pub mod models;
pub mod service;
pub mod vector_store;

pub use api_client::{ApiAuth, ApiError, ApiRequest, CircuitBreaker, ResilientApiClient};
pub use cache::{cache_key, EmbeddingCache};
pub use config::TandemConfig;
pub use documents::{
    DocumentStore, DocumentStoreError, DocumentTransaction, MemoryDocumentStore, PgDocumentStore,
};
pub use embeddings::{
    create_provider, EmbeddingError, EmbeddingProvider, GeminiEmbeddingProvider,
    HashEmbeddingProvider, OpenAiEmbeddingProvider, ProviderHandle,
};
pub use error::TandemError;
pub use models::{EmbeddingRecord, PendingWrite, RecordKey, SearchFilters, SearchHit};
pub use service::{EmbeddingService, GeneratedEmbedding};
pub use vector_store::{
    BatchUpsertReport, HealthReport, MemoryVectorStore, PgVectorStore, VectorStore,
    VectorStoreError,
};
