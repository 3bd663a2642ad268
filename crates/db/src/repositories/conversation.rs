use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::conversation::{
    Assignee, Conversation, ConversationId, ConversationSlug, ConversationStatus, NewConversation,
};
use parley_core::similarity::rank_by_similarity;

use super::{parse_json, parse_timestamp, ConversationRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
    id,
    slug,
    status,
    assigned_to_ai,
    assigned_to_user_id,
    subject,
    summary_json,
    embedding_json,
    customer_email,
    created_at,
    updated_at,
    closed_at
 FROM conversation";

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn create(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, RepositoryError> {
        let now = Utc::now();
        let (assigned_to_ai, assigned_to_user_id) = conversation.assignee.to_columns();

        let result = sqlx::query(
            "INSERT INTO conversation (
                slug,
                status,
                assigned_to_ai,
                assigned_to_user_id,
                subject,
                customer_email,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&conversation.slug.0)
        .bind(conversation.status.as_str())
        .bind(assigned_to_ai)
        .bind(assigned_to_user_id)
        .bind(&conversation.subject)
        .bind(conversation.customer_email.as_deref())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Conversation {
            id: ConversationId(result.last_insert_rowid()),
            slug: conversation.slug,
            status: conversation.status,
            assignee: conversation.assignee,
            subject: conversation.subject,
            summary: None,
            embedding: None,
            customer_email: conversation.customer_email,
            created_at: now,
            updated_at: now,
            closed_at: None,
        })
    }

    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(conversation_from_row).transpose()
    }

    async fn find_by_slug(
        &self,
        slug: &ConversationSlug,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE slug = ?"))
            .bind(&slug.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(conversation_from_row).transpose()
    }

    async fn update_state(
        &self,
        id: &ConversationId,
        status: ConversationStatus,
        assignee: &Assignee,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let (assigned_to_ai, assigned_to_user_id) = assignee.to_columns();

        // The first close wins; reopening clears the timestamp.
        let result = sqlx::query(
            "UPDATE conversation SET
                status = ?,
                assigned_to_ai = ?,
                assigned_to_user_id = ?,
                closed_at = CASE WHEN ? = 'closed' THEN COALESCE(closed_at, ?) ELSE NULL END,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(assigned_to_ai)
        .bind(assigned_to_user_id)
        .bind(status.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("conversation {}", id.0)));
        }
        Ok(())
    }

    async fn update_subject(
        &self,
        id: &ConversationId,
        subject: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE conversation SET subject = ?, updated_at = ? WHERE id = ?")
            .bind(subject)
            .bind(Utc::now().to_rfc3339())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_summary(
        &self,
        id: &ConversationId,
        summary: &[String],
    ) -> Result<(), RepositoryError> {
        let summary_json = serde_json::to_string(summary)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        sqlx::query("UPDATE conversation SET summary_json = ?, updated_at = ? WHERE id = ?")
            .bind(summary_json)
            .bind(Utc::now().to_rfc3339())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_embedding(
        &self,
        id: &ConversationId,
        embedding: &[f32],
    ) -> Result<(), RepositoryError> {
        let embedding_json = serde_json::to_string(embedding)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        sqlx::query("UPDATE conversation SET embedding_json = ?, updated_at = ? WHERE id = ?")
            .bind(embedding_json)
            .bind(Utc::now().to_rfc3339())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_similar_closed(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        exclude: Option<&ConversationSlug>,
    ) -> Result<Vec<(Conversation, f32)>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = 'closed' AND embedding_json IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = conversation_from_row(row)?;
            if exclude.is_some_and(|slug| slug == &conversation.slug) {
                continue;
            }
            let Some(stored) = conversation.embedding.clone() else { continue };
            candidates.push((conversation, stored));
        }

        Ok(rank_by_similarity(embedding, candidates, threshold, limit))
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    let status_raw: String = row.get("status");
    let status = ConversationStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conversation status `{status_raw}`"))
    })?;

    let assigned_to_ai: bool = row.get("assigned_to_ai");
    let assigned_to_user_id: Option<String> = row.get("assigned_to_user_id");
    let assignee = Assignee::from_columns(assigned_to_ai, assigned_to_user_id).ok_or_else(|| {
        RepositoryError::Decode("conversation is both AI- and human-assigned".to_string())
    })?;

    let summary = row
        .get::<Option<String>, _>("summary_json")
        .map(|raw| parse_json::<Vec<String>>("summary_json", &raw))
        .transpose()?;
    let embedding = row
        .get::<Option<String>, _>("embedding_json")
        .map(|raw| parse_json::<Vec<f32>>("embedding_json", &raw))
        .transpose()?;

    Ok(Conversation {
        id: ConversationId(row.get("id")),
        slug: ConversationSlug(row.get("slug")),
        status,
        assignee,
        subject: row.get("subject"),
        summary,
        embedding,
        customer_email: row.get("customer_email"),
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp("updated_at", &row.get::<String, _>("updated_at"))?,
        closed_at: row
            .get::<Option<String>, _>("closed_at")
            .map(|raw| parse_timestamp("closed_at", &raw))
            .transpose()?,
    })
}
