use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Composite key under which a vector row is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub id: String,
    pub model_version: String,
    pub chunk_type: String,
}

impl RecordKey {
    pub fn new(
        id: impl Into<String>,
        model_version: impl Into<String>,
        chunk_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model_version: model_version.into(),
            chunk_type: chunk_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
    pub chunk_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EmbeddingRecord {
    pub fn new(
        id: impl Into<String>,
        vector: Vec<f32>,
        model_version: impl Into<String>,
        chunk_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            vector,
            model_version: model_version.into(),
            chunk_type: chunk_type.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.id, &self.model_version, &self.chunk_type)
    }
}

/// Optional restrictions applied to a similarity search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub model_version: Option<String>,
    pub chunk_type: Option<String>,
}

impl SearchFilters {
    pub fn matches(&self, model_version: &str, chunk_type: &str) -> bool {
        self.model_version.as_deref().map_or(true, |m| m == model_version)
            && self.chunk_type.as_deref().map_or(true, |c| c == chunk_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub model_version: String,
    pub chunk_type: String,
    /// `1 - cosine_distance`
    pub similarity: f64,
    pub metadata: Value,
}
