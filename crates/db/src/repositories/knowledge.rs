use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::knowledge::KnowledgeBankEntry;
use parley_core::similarity::rank_by_similarity;

use super::{parse_json, KnowledgeBankRepository, RepositoryError};
use crate::DbPool;

pub struct SqlKnowledgeBankRepository {
    pool: DbPool,
}

impl SqlKnowledgeBankRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl KnowledgeBankRepository for SqlKnowledgeBankRepository {
    async fn insert(&self, entry: KnowledgeBankEntry) -> Result<(), RepositoryError> {
        let embedding_json = serde_json::to_string(&entry.embedding)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        sqlx::query(
            "INSERT INTO knowledge_bank_entry (content, embedding_json, enabled)
             VALUES (?, ?, ?)",
        )
        .bind(&entry.content)
        .bind(embedding_json)
        .bind(entry.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_similar_enabled(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(KnowledgeBankEntry, f32)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, content, embedding_json, enabled
             FROM knowledge_bank_entry
             WHERE enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = entry_from_row(row)?;
            let stored = entry.embedding.clone();
            candidates.push((entry, stored));
        }

        Ok(rank_by_similarity(embedding, candidates, threshold, limit))
    }
}

fn entry_from_row(row: SqliteRow) -> Result<KnowledgeBankEntry, RepositoryError> {
    Ok(KnowledgeBankEntry {
        id: row.get("id"),
        content: row.get("content"),
        embedding: parse_json("embedding_json", &row.get::<String, _>("embedding_json"))?,
        enabled: row.get("enabled"),
    })
}
