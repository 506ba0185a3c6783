//! Cache-fronted embedding generation with a deterministic fallback.
//!
//! Lookup chain: cache → active provider → hash fallback. A fallback vector
//! is cached under the fallback provider's key, so a later lookup for the
//! primary provider still misses and retries the real model.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{cache_key, CacheStats, EmbeddingCache};
use crate::config::EmbeddingConfig;
use crate::embeddings::{
    check_dimensions, EmbeddingError, EmbeddingProvider, HashEmbeddingProvider,
};

/// Result of a single generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedEmbedding {
    pub vector: Vec<f32>,
    pub cache_hit: bool,
    pub provider: String,
    pub model: String,
    pub fallback: bool,
    pub elapsed: Duration,
}

pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    fallback: HashEmbeddingProvider,
    cache: EmbeddingCache,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: EmbeddingCache) -> Self {
        let fallback = HashEmbeddingProvider::new(provider.dimensions());
        Self {
            provider,
            fallback,
            cache,
        }
    }

    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        let cache = EmbeddingCache::new(
            config.cache_max_entries,
            Duration::from_secs(config.cache_ttl_seconds),
        );
        Self::new(provider, cache)
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn sweep_cache(&self) {
        self.cache.sweep();
    }

    fn cached(&self, key_for: &dyn EmbeddingProvider, text: &str) -> Option<Vec<f32>> {
        self.cache.get(&document_key(key_for, text))
    }

    fn hit(
        &self,
        vector: Vec<f32>,
        from: &dyn EmbeddingProvider,
        started: Instant,
        fallback: bool,
    ) -> GeneratedEmbedding {
        GeneratedEmbedding {
            vector,
            cache_hit: true,
            provider: from.name().to_string(),
            model: from.model().to_string(),
            fallback,
            elapsed: started.elapsed(),
        }
    }

    fn store(
        &self,
        key: String,
        vector: Vec<f32>,
        from: &dyn EmbeddingProvider,
        started: Instant,
        fallback: bool,
    ) -> GeneratedEmbedding {
        self.cache.insert(key, &vector);
        GeneratedEmbedding {
            vector,
            cache_hit: false,
            provider: from.name().to_string(),
            model: from.model().to_string(),
            fallback,
            elapsed: started.elapsed(),
        }
    }

    fn fallback_for(&self, text: &str, started: Instant) -> GeneratedEmbedding {
        match self.cached(&self.fallback, text) {
            Some(vector) => self.hit(vector, &self.fallback, started, true),
            None => {
                let vector = self.fallback.embed_sync(text);
                let key = document_key(&self.fallback, text);
                self.store(key, vector, &self.fallback, started, true)
            }
        }
    }

    /// Embed one text.
    ///
    /// Validation failures (empty input, wrong dimensionality) are returned
    /// as errors; any other provider failure falls back to the hash provider.
    pub async fn generate(&self, text: &str) -> Result<GeneratedEmbedding, EmbeddingError> {
        let started = Instant::now();
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        if let Some(vector) = self.cached(self.provider.as_ref(), text) {
            tracing::debug!(provider = self.provider.name(), "Embedding cache hit");
            return Ok(self.hit(vector, self.provider.as_ref(), started, false));
        }

        match self.provider.generate(text).await {
            Ok(vector) => {
                check_dimensions(&vector, self.dimensions())?;
                let key = document_key(self.provider.as_ref(), text);
                Ok(self.store(key, vector, self.provider.as_ref(), started, false))
            }
            Err(e) if e.is_validation() => Err(e),
            Err(e) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %e,
                    "Embedding provider failed, using hash fallback"
                );
                Ok(self.fallback_for(text, started))
            }
        }
    }

    /// Embed a search query.
    ///
    /// Query vectors are cached apart from document vectors, since providers
    /// with task hints embed the same text differently. Fallback rules match
    /// [`generate`](Self::generate).
    pub async fn generate_query(&self, text: &str) -> Result<GeneratedEmbedding, EmbeddingError> {
        let started = Instant::now();
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let key = query_key(self.provider.as_ref(), text);
        if let Some(vector) = self.cache.get(&key) {
            return Ok(self.hit(vector, self.provider.as_ref(), started, false));
        }

        match self.provider.generate_query(text).await {
            Ok(vector) => {
                check_dimensions(&vector, self.dimensions())?;
                Ok(self.store(key, vector, self.provider.as_ref(), started, false))
            }
            Err(e) if e.is_validation() => Err(e),
            Err(e) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %e,
                    "Query embedding failed, using hash fallback"
                );
                Ok(self.fallback_for(text, started))
            }
        }
    }

    /// Embed several texts with one provider call for all cache misses.
    ///
    /// Output order matches input order.
    pub async fn generate_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<GeneratedEmbedding>, EmbeddingError> {
        let started = Instant::now();
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut out: Vec<Option<GeneratedEmbedding>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match self.cached(self.provider.as_ref(), text) {
                Some(vector) => {
                    out.push(Some(self.hit(vector, self.provider.as_ref(), started, false)))
                }
                None => {
                    out.push(None);
                    misses.push(i);
                }
            }
        }

        if misses.is_empty() {
            return Ok(out.into_iter().flatten().collect());
        }

        let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
        match self.provider.generate_batch(&miss_texts).await {
            Ok(vectors) => {
                if vectors.len() != miss_texts.len() {
                    return Err(EmbeddingError::CountMismatch {
                        expected: miss_texts.len(),
                        actual: vectors.len(),
                    });
                }
                for v in &vectors {
                    check_dimensions(v, self.dimensions())?;
                }
                for (&i, vector) in misses.iter().zip(vectors) {
                    let key = document_key(self.provider.as_ref(), &texts[i]);
                    let generated =
                        self.store(key, vector, self.provider.as_ref(), started, false);
                    out[i] = Some(generated);
                }
            }
            Err(e) if e.is_validation() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    count = misses.len(),
                    error = %e,
                    "Batch embedding failed, using hash fallback"
                );
                for &i in &misses {
                    out[i] = Some(self.fallback_for(&texts[i], started));
                }
            }
        }

        Ok(out.into_iter().flatten().collect())
    }
}

fn document_key(provider: &dyn EmbeddingProvider, text: &str) -> String {
    cache_key(text, provider.name(), provider.model())
}

fn query_key(provider: &dyn EmbeddingProvider, text: &str) -> String {
    cache_key(text, provider.name(), &format!("{}#query", provider.model()))
}

// ============================================================================
// TESTS
// ============================================================================
