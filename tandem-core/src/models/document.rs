use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document write waiting in a collection buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub collection: String,
    pub doc_id: String,
    pub data: Map<String, Value>,
    /// Merge into an existing document instead of replacing it.
    pub upsert: bool,
    /// Number of times this write came back from an exhausted flush.
    #[serde(default)]
    pub attempts: u32,
}

impl PendingWrite {
    /// Serialized size, used for byte-threshold flushing.
    pub fn approx_bytes(&self) -> usize {
        let data = serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0);
        data + self.doc_id.len() + self.collection.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub data: Map<String, Value>,
}
