//! Embedding providers behind a single trait.
//!
//! - **hash** — deterministic, offline vectors (fallback, tests, dev)
//! - **openai** — OpenAI-compatible `/embeddings`, bearer auth
//! - **gemini** — Gemini `embedContent` / `batchEmbedContents`, API key header
//!
//! Remote providers send their requests through a shared
//! [`ResilientApiClient`], so retries, concurrency limits and the circuit
//! breaker apply uniformly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::api_client::{ApiAuth, ApiError, ApiRequest, ResilientApiClient};
use crate::config::{ApiClientConfig, EmbeddingConfig, ProviderKind};

/// Default Gemini embedding dimensions
pub const GEMINI_DIMENSIONS: usize = 768;

// ============================================================================
// EmbeddingProvider trait
// ============================================================================

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name, part of the cache key.
    fn name(&self) -> &str;

    /// Model identifier, part of the cache key.
    fn model(&self) -> &str;

    /// Returns the embedding dimension (e.g., 768).
    fn dimensions(&self) -> usize;

    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a search query. Providers with task-type hints override this;
    /// the default embeds it like a document.
    async fn generate_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.generate(text).await
    }

    /// Embed several texts. Output order matches input order.
    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.generate(text).await?);
        }
        Ok(out)
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Embedding generation errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Upstream API error: {0}")]
    Api(#[from] ApiError),

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Invalid response: expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("Missing API key (set {var})")]
    MissingApiKey { var: String },

    #[error("Cannot embed empty text")]
    EmptyInput,
}

impl EmbeddingError {
    /// Errors caused by the input or by a dimensionality violation. These are
    /// never papered over by the fallback provider.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EmbeddingError::InvalidDimensions { .. } | EmbeddingError::EmptyInput
        )
    }
}

pub(crate) fn check_dimensions(vector: &[f32], expected: usize) -> Result<(), EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::InvalidDimensions {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

// ============================================================================
// HashEmbeddingProvider
// ============================================================================

/// Deterministic feature-hashing embeddings.
///
/// Each lower-cased alphanumeric token is hashed with SHA-256 into a signed
/// bucket; the result is L2-normalised. Identical text always yields the
/// identical vector, on every platform.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
    model: String,
}

impl HashEmbeddingProvider {
    pub const NAME: &'static str = "hash";

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model: "sha256-buckets-v1".to_string(),
        }
    }

    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
    }

    fn bucket(&self, bytes: &[u8]) -> (usize, f32) {
        let digest = Sha256::digest(bytes);
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(idx) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vec;
        }

        let mut any = false;
        for token in Self::tokenize(text) {
            let (bucket, sign) = self.bucket(token.as_bytes());
            vec[bucket] += sign;
            any = true;
        }
        if !any {
            let (bucket, sign) = self.bucket(text.as_bytes());
            vec[bucket] = sign;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

// ============================================================================
// OpenAI-compatible provider
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingProvider {
    client: Arc<ResilientApiClient>,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl OpenAiEmbeddingProvider {
    pub const NAME: &'static str = "openai";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    pub fn new(
        client: Arc<ResilientApiClient>,
        model: impl Into<String>,
        dimensions: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
            batch_size: batch_size.max(1),
        }
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::to_value(OpenAiRequest {
            model: &self.model,
            input: texts,
            dimensions: Some(self.dimensions),
        })
        .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        let value = self
            .client
            .call(&ApiRequest::post("embeddings", body))
            .await?;

        let mut parsed: OpenAiResponse = serde_json::from_value(value)
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: parsed.data.len(),
            });
        }
        parsed.data.sort_by_key(|entry| entry.index);

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|e| e.embedding).collect();
        for v in &vectors {
            check_dimensions(v, self.dimensions)?;
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_chunk(&[text.to_string()]).await?;
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }
}

// ============================================================================
// Gemini provider
// ============================================================================

/// Task type for embedding API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    RetrievalDocument,
    RetrievalQuery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    model: String,
    content: GeminiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_type: Option<TaskType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiBatchRequest {
    requests: Vec<GeminiRequest>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    embedding: GeminiEmbedding,
}

#[derive(Debug, Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

/// Gemini embedding provider.
#[derive(Debug, Clone)]
pub struct GeminiEmbeddingProvider {
    client: Arc<ResilientApiClient>,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl GeminiEmbeddingProvider {
    pub const NAME: &'static str = "gemini";
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(
        client: Arc<ResilientApiClient>,
        model: impl Into<String>,
        dimensions: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
            batch_size: batch_size.max(1),
        }
    }

    fn request_for(&self, text: &str, task_type: TaskType) -> GeminiRequest {
        GeminiRequest {
            model: format!("models/{}", self.model),
            content: GeminiContent {
                parts: vec![GeminiPart {
                    text: text.to_string(),
                }],
            },
            task_type: Some(task_type),
            output_dimensionality: Some(self.dimensions),
        }
    }

    async fn embed_with_task(
        &self,
        text: &str,
        task_type: TaskType,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::to_value(self.request_for(text, task_type))
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        let value = self
            .client
            .call(&ApiRequest::post(
                format!("models/{}:embedContent", self.model),
                body,
            ))
            .await?;

        let parsed: GeminiResponse = serde_json::from_value(value)
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        check_dimensions(&parsed.embedding.values, self.dimensions)?;
        Ok(parsed.embedding.values)
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let batch = GeminiBatchRequest {
            requests: texts
                .iter()
                .map(|t| self.request_for(t, TaskType::RetrievalDocument))
                .collect(),
        };
        let body = serde_json::to_value(batch)
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        let value = self
            .client
            .call(&ApiRequest::post(
                format!("models/{}:batchEmbedContents", self.model),
                body,
            ))
            .await?;

        let parsed: GeminiBatchResponse = serde_json::from_value(value)
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: parsed.embeddings.len(),
            });
        }

        let vectors: Vec<Vec<f32>> = parsed.embeddings.into_iter().map(|e| e.values).collect();
        for v in &vectors {
            check_dimensions(v, self.dimensions)?;
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_with_task(text, TaskType::RetrievalDocument).await
    }

    async fn generate_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_with_task(text, TaskType::RetrievalQuery).await
    }

    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// A provider plus the API client it talks through (if remote).
pub struct ProviderHandle {
    pub provider: Arc<dyn EmbeddingProvider>,
    pub client: Option<Arc<ResilientApiClient>>,
}

/// Create the configured provider.
///
/// Remote providers read their API key from `api_key_env` (default
/// `OPENAI_API_KEY` / `GOOGLE_API_KEY`).
pub fn create_provider(
    config: &EmbeddingConfig,
    api: &ApiClientConfig,
) -> Result<ProviderHandle, EmbeddingError> {
    let (default_env, default_url) = match config.provider {
        ProviderKind::Hash => {
            return Ok(ProviderHandle {
                provider: Arc::new(HashEmbeddingProvider::new(config.dimensions)),
                client: None,
            });
        }
        ProviderKind::Openai => ("OPENAI_API_KEY", OpenAiEmbeddingProvider::DEFAULT_BASE_URL),
        ProviderKind::Gemini => ("GOOGLE_API_KEY", GeminiEmbeddingProvider::DEFAULT_BASE_URL),
    };

    let var = config
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_env.to_string());
    let api_key = std::env::var(&var).unwrap_or_default();
    if api_key.trim().is_empty() {
        return Err(EmbeddingError::MissingApiKey { var });
    }

    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| default_url.to_string());

    let auth = match config.provider {
        ProviderKind::Gemini => ApiAuth::Header {
            name: "x-goog-api-key".to_string(),
            value: api_key,
        },
        _ => ApiAuth::Bearer(api_key),
    };

    let client = Arc::new(ResilientApiClient::new(base_url, auth, api.clone())?);

    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        ProviderKind::Gemini => Arc::new(GeminiEmbeddingProvider::new(
            Arc::clone(&client),
            config.model.clone(),
            config.dimensions,
            config.batch_size,
        )),
        _ => Arc::new(OpenAiEmbeddingProvider::new(
            Arc::clone(&client),
            config.model.clone(),
            config.dimensions,
            config.batch_size,
        )),
    };

    tracing::info!(
        provider = provider.name(),
        model = provider.model(),
        dims = provider.dimensions(),
        "Embedding provider initialized"
    );

    Ok(ProviderHandle {
        provider,
        client: Some(client),
    })
}

// ============================================================================
// TESTS
// ============================================================================
