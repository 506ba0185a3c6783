//! Content-addressed embedding cache.
//!
//! Keys are SHA-256 digests of `(normalized text, provider, model)`, so the
//! same text embedded by two providers never shares an entry. Entries expire
//! after a TTL; expired entries read as misses and are evicted lazily, or
//! eagerly through [`EmbeddingCache::sweep`].

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Collapse runs of whitespace and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key for `text` embedded by `provider`/`model`.
pub fn cache_key(text: &str, provider: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hasher.update([0u8]);
    hasher.update(provider.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub vector: Arc<[f32]>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

pub struct EmbeddingCache {
    cache: Cache<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.created_at);
        age.to_std().map_or(false, |age| age >= self.ttl)
    }

    /// Returns a copy of the cached vector, `None` on miss or expiry.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.get(key) {
            Some(entry) if !self.is_expired(&entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.vector.to_vec())
            }
            Some(_) => {
                self.cache.invalidate(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, vector: &[f32]) {
        let entry = CacheEntry {
            key: key.clone(),
            vector: Arc::from(vector),
            created_at: Utc::now(),
        };
        self.cache.insert(key, entry);
    }

    /// Drop expired entries now instead of waiting for the next access.
    pub fn sweep(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalizes_whitespace() {
        assert_eq!(
            cache_key("  Rust   engineer\n", "openai", "m"),
            cache_key("Rust engineer", "openai", "m")
        );
        assert_eq!(cache_key("a", "p", "m").len(), 64);
    }

    #[test]
    fn test_key_separates_provider_and_model() {
        let base = cache_key("Rust engineer", "openai", "small");
        assert_ne!(base, cache_key("Rust engineer", "gemini", "small"));
        assert_ne!(base, cache_key("Rust engineer", "openai", "large"));
        // Separator keeps ("ab", "c") distinct from ("a", "bc").
        assert_ne!(cache_key("x", "ab", "c"), cache_key("x", "a", "bc"));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = EmbeddingCache::new(100, Duration::from_secs(60));
        let key = cache_key("hello", "hash", "v1");

        assert_eq!(cache.get(&key), None);
        cache.insert(key.clone(), &[0.1, 0.2]);
        assert_eq!(cache.get(&key), Some(vec![0.1, 0.2]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = EmbeddingCache::new(100, Duration::from_millis(30));
        let key = cache_key("hello", "hash", "v1");
        cache.insert(key.clone(), &[1.0]);
        assert!(cache.get(&key).is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&key), None);

        cache.sweep();
        assert_eq!(cache.stats().entries, 0);
    }
}
