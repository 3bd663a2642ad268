//! Embedding computation with a content-addressed read-through cache.
//!
//! The cache key hashes the newline-normalized input so cosmetically
//! different but semantically identical texts share a line. Cache backend
//! failures degrade to direct provider computation and are never surfaced
//! as request failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use parley_core::domain::embedding::{embedding_cache_key, EmbeddingCacheEntry};
use parley_db::repositories::EmbeddingStore;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(String),
    #[error("embedding provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("could not decode embedding response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// OpenAI-style `/embeddings` endpoint client.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| EmbeddingError::Transport(error.to_string()))?;
        Ok(Self { client, base_url: base_url.into(), model: model.into(), api_key })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": self.model, "input": text }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| EmbeddingError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider { status: status.as_u16(), body });
        }

        let decoded: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::Decode(error.to_string()))?;
        decoded
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| EmbeddingError::Decode("empty embedding data".to_string()))
    }
}

/// Read-through cache over an [`EmbeddingProvider`]. Injected explicitly so
/// tests can substitute a deterministic store and provider.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn EmbeddingStore>,
    ttl: chrono::Duration,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn EmbeddingStore>,
        ttl_days: i64,
    ) -> Self {
        Self { provider, store, ttl: chrono::Duration::days(ttl_days) }
    }

    /// `skip_cache` bypasses both the read and the write, for inputs whose
    /// freshness matters more than cost (for example just-edited content).
    pub async fn embed(&self, text: &str, skip_cache: bool) -> Result<Vec<f32>, EmbeddingError> {
        let key = embedding_cache_key(text);
        let now = Utc::now();

        if !skip_cache {
            match self.store.get(&key, now).await {
                Ok(Some(entry)) => return Ok(entry.vector),
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        event_name = "engine.embedding.cache_read_failed",
                        error = %error,
                        "embedding cache read failed; computing directly"
                    );
                }
            }
        }

        let vector = self.provider.embed(text).await?;

        if !skip_cache {
            let entry = EmbeddingCacheEntry {
                key,
                vector: vector.clone(),
                expires_at: now + self.ttl,
            };
            if let Err(error) = self.store.put(entry).await {
                warn!(
                    event_name = "engine.embedding.cache_write_failed",
                    error = %error,
                    "embedding cache write failed; continuing without caching"
                );
            }
        }

        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parley_db::repositories::InMemoryEmbeddingStore;

    use super::{EmbeddingError, EmbeddingProvider, EmbeddingService};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_the_cache() {
        let provider = CountingProvider::new();
        let store = Arc::new(InMemoryEmbeddingStore::default());
        let service = EmbeddingService::new(provider.clone(), store, 30);

        let first = service.embed("refund question", false).await.expect("embed");
        let second = service.embed("refund question", false).await.expect("embed");

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn newline_variants_share_the_cached_vector() {
        let provider = CountingProvider::new();
        let store = Arc::new(InMemoryEmbeddingStore::default());
        let service = EmbeddingService::new(provider.clone(), store, 30);

        service.embed("refund for order", false).await.expect("embed");
        service.embed("refund for\norder", false).await.expect("embed");

        // Same cache line: normalization happens at the key, not the text.
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn skip_cache_bypasses_read_and_write() {
        let provider = CountingProvider::new();
        let store = Arc::new(InMemoryEmbeddingStore::default());
        let service = EmbeddingService::new(provider.clone(), store.clone(), 30);

        service.embed("draft text", true).await.expect("embed");
        service.embed("draft text", true).await.expect("embed");

        assert_eq!(provider.calls(), 2);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn cache_failure_degrades_to_direct_computation() {
        let provider = CountingProvider::new();
        let store = Arc::new(InMemoryEmbeddingStore::default());
        store.fail_all();
        let service = EmbeddingService::new(provider.clone(), store, 30);

        let vector = service.embed("anything", false).await.expect("embed");
        assert_eq!(vector, vec![8.0, 1.0]);
        assert_eq!(provider.calls(), 1);
    }
}
