use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::conversation::ConversationId;
use parley_core::domain::message::MessageId;
use parley_core::domain::notification::{MessageNotification, NewMessageNotification};

use super::{parse_timestamp, NotificationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlNotificationRepository {
    pool: DbPool,
}

impl SqlNotificationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NotificationRepository for SqlNotificationRepository {
    async fn create(
        &self,
        notification: NewMessageNotification,
    ) -> Result<bool, RepositoryError> {
        // Unique on message_id: redelivery of the same fanout event is a
        // no-op.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_notification (
                message_id,
                conversation_id,
                customer_email,
                notification_text,
                created_at
             ) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(notification.message_id.0)
        .bind(notification.conversation_id.0)
        .bind(&notification.customer_email)
        .bind(&notification.notification_text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageNotification>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, message_id, conversation_id, customer_email, notification_text, created_at
             FROM message_notification
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(notification_from_row).collect()
    }
}

fn notification_from_row(row: SqliteRow) -> Result<MessageNotification, RepositoryError> {
    Ok(MessageNotification {
        id: row.get("id"),
        message_id: MessageId(row.get("message_id")),
        conversation_id: ConversationId(row.get("conversation_id")),
        customer_email: row.get("customer_email"),
        notification_text: row.get("notification_text"),
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
    })
}
