use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::conversation::ConversationId;
use parley_core::domain::escalation::{EscalationEvent, EscalationTrigger, NewEscalationEvent};

use super::{parse_timestamp, EscalationEventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEscalationEventRepository {
    pool: DbPool,
}

impl SqlEscalationEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EscalationEventRepository for SqlEscalationEventRepository {
    async fn append(
        &self,
        event: NewEscalationEvent,
    ) -> Result<EscalationEvent, RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO escalation_event (conversation_id, reason, triggered_by, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(event.conversation_id.0)
        .bind(event.reason.as_deref())
        .bind(event.triggered_by.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(EscalationEvent {
            id: result.last_insert_rowid(),
            conversation_id: event.conversation_id,
            reason: event.reason,
            triggered_by: event.triggered_by,
            created_at: now,
        })
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<EscalationEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, reason, triggered_by, created_at
             FROM escalation_event
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: SqliteRow) -> Result<EscalationEvent, RepositoryError> {
    let trigger_raw: String = row.get("triggered_by");
    let triggered_by = EscalationTrigger::parse(&trigger_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown escalation trigger `{trigger_raw}`"))
    })?;

    Ok(EscalationEvent {
        id: row.get("id"),
        conversation_id: ConversationId(row.get("conversation_id")),
        reason: row.get("reason"),
        triggered_by,
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use parley_core::domain::conversation::NewConversation;
    use parley_core::domain::escalation::{EscalationTrigger, NewEscalationEvent};

    use crate::repositories::{
        ConversationRepository, EscalationEventRepository, SqlConversationRepository,
        SqlEscalationEventRepository,
    };
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn append_is_ordered_and_round_trips() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let conversations = SqlConversationRepository::new(pool.clone());
        let events = SqlEscalationEventRepository::new(pool);

        let conversation =
            conversations.create(NewConversation::inbound(None)).await.expect("create");

        events
            .append(NewEscalationEvent {
                conversation_id: conversation.id,
                reason: Some("explicit request".to_string()),
                triggered_by: EscalationTrigger::ExplicitToolCall,
            })
            .await
            .expect("append");
        events
            .append(NewEscalationEvent {
                conversation_id: conversation.id,
                reason: None,
                triggered_by: EscalationTrigger::HumanReply,
            })
            .await
            .expect("append");

        let listed = events.list_for_conversation(&conversation.id).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].triggered_by, EscalationTrigger::ExplicitToolCall);
        assert_eq!(listed[0].reason.as_deref(), Some("explicit request"));
        assert_eq!(listed[1].triggered_by, EscalationTrigger::HumanReply);
    }
}
