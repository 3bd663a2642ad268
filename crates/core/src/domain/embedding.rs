use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pure cache: absence never changes correctness, only cost and latency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCacheEntry {
    pub key: String,
    pub vector: Vec<f32>,
    pub expires_at: DateTime<Utc>,
}

impl EmbeddingCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Content address for a cached embedding: blake3 of the text with internal
/// newlines collapsed to spaces, so cosmetically different but semantically
/// identical inputs share a cache line.
pub fn embedding_cache_key(text: &str) -> String {
    let normalized = text
        .replace("\r\n", " ")
        .replace(['\n', '\r'], " ");
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}
