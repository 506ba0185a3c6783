//! Wiring from [`TandemConfig`] to live components.

use sqlx::PgPool;
use std::sync::Arc;
use tandem_core::api_client::ResilientApiClient;
use tandem_core::{
    create_provider, EmbeddingService, PgDocumentStore, PgVectorStore, TandemConfig, TandemError,
};

use crate::subsystems::migrate::{MigrationOptions, MigrationOrchestrator};
use crate::subsystems::source::{create_source, SourceError};
use crate::subsystems::writer::{BatchedDocumentWriter, WriterError};

/// Every long-lived component, built once from config and shared by `Arc`.
pub struct AppContext {
    pub config: TandemConfig,
    pub pool: PgPool,
    pub vector_store: Arc<PgVectorStore>,
    pub documents: Arc<PgDocumentStore>,
    pub embeddings: Arc<EmbeddingService>,
    pub api_client: Option<Arc<ResilientApiClient>>,
}

impl AppContext {
    /// Connect to Postgres, make sure both schemas exist and build the
    /// embedding stack.
    pub async fn connect(config: TandemConfig) -> Result<Self, TandemError> {
        if config.embedding.dimensions != config.vector_store.dimensions {
            return Err(TandemError::Other(format!(
                "embedding.dimensions ({}) must equal vector_store.dimensions ({})",
                config.embedding.dimensions, config.vector_store.dimensions
            )));
        }

        let pool = tandem_core::db::create_pool(&config.database).await?;

        let vector_store = PgVectorStore::new(pool.clone(), &config.vector_store)?;
        vector_store.ensure_schema().await?;

        let documents = PgDocumentStore::new(pool.clone(), &config.writer.documents_table)?;
        documents.ensure_schema().await?;

        let handle = create_provider(&config.embedding, &config.api)?;
        let embeddings = EmbeddingService::from_config(handle.provider, &config.embedding);

        tracing::info!(
            table = %config.vector_store.table,
            dims = config.vector_store.dimensions,
            provider = embeddings.provider().name(),
            "Application context ready"
        );

        Ok(Self {
            config,
            pool,
            vector_store: Arc::new(vector_store),
            documents: Arc::new(documents),
            embeddings: Arc::new(embeddings),
            api_client: handle.client,
        })
    }

    pub fn migration(&self, options: MigrationOptions) -> Result<MigrationOrchestrator, SourceError> {
        let source = create_source(&self.config.migration.source, Some(self.documents.clone()))?;
        Ok(MigrationOrchestrator::new(
            source,
            Arc::clone(&self.embeddings),
            self.vector_store.clone(),
            options,
        ))
    }

    pub fn writer(&self) -> Result<BatchedDocumentWriter, WriterError> {
        BatchedDocumentWriter::new(self.documents.clone(), self.config.writer.clone())
    }

    /// Stop outbound API traffic and drain the pool.
    pub async fn close(&self) {
        if let Some(client) = &self.api_client {
            client.close();
        }
        self.pool.close().await;
        tracing::info!("Application context closed");
    }
}
