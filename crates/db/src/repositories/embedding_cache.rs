use chrono::{DateTime, Utc};

use parley_core::domain::embedding::EmbeddingCacheEntry;
use sqlx::Row;

use super::{parse_json, parse_timestamp, EmbeddingStore, RepositoryError};
use crate::DbPool;

pub struct SqlEmbeddingStore {
    pool: DbPool,
}

impl SqlEmbeddingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EmbeddingStore for SqlEmbeddingStore {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingCacheEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT key, vector_json, expires_at FROM embedding_cache WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let entry = EmbeddingCacheEntry {
            key: row.get("key"),
            vector: parse_json("vector_json", &row.get::<String, _>("vector_json"))?,
            expires_at: parse_timestamp("expires_at", &row.get::<String, _>("expires_at"))?,
        };

        if entry.is_expired(now) {
            // Lazily evict; the next put overwrites in any case.
            sqlx::query("DELETE FROM embedding_cache WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn put(&self, entry: EmbeddingCacheEntry) -> Result<(), RepositoryError> {
        let vector_json = serde_json::to_string(&entry.vector)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        sqlx::query(
            "INSERT INTO embedding_cache (key, vector_json, expires_at)
             VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                vector_json = excluded.vector_json,
                expires_at = excluded.expires_at",
        )
        .bind(&entry.key)
        .bind(vector_json)
        .bind(entry.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
