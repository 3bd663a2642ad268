use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::conversation::ConversationId;
use parley_core::domain::message::{Message, MessageId, MessageRole, NewMessage};
use parley_core::domain::tool::ToolInvocationResult;

use super::{parse_json, parse_timestamp, MessageRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
    id,
    conversation_id,
    role,
    body,
    cleaned_text,
    tool_invocation_json,
    is_flagged_as_bad,
    flag_reason,
    created_at
 FROM conversation_message";

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn insert(&self, message: NewMessage) -> Result<Message, RepositoryError> {
        let now = Utc::now();
        let tool_invocation_json = message
            .tool_invocation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO conversation_message (
                conversation_id,
                role,
                body,
                cleaned_text,
                tool_invocation_json,
                is_flagged_as_bad,
                created_at
             ) VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(message.conversation_id.0)
        .bind(message.role.as_str())
        .bind(&message.body)
        .bind(&message.cleaned_text)
        .bind(tool_invocation_json)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id: MessageId(result.last_insert_rowid()),
            conversation_id: message.conversation_id,
            role: message.role,
            body: message.body,
            cleaned_text: message.cleaned_text,
            tool_invocation: message.tool_invocation,
            is_flagged_as_bad: false,
            flag_reason: None,
            created_at: now,
        })
    }

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE conversation_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn count_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_message WHERE conversation_id = ?",
        )
        .bind(conversation_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn first_user_message(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE conversation_id = ? AND role = 'user' \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    async fn set_flagged(
        &self,
        id: &MessageId,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE conversation_message SET is_flagged_as_bad = 1, flag_reason = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("message {}", id.0)));
        }
        Ok(())
    }
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw: String = row.get("role");
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;

    let tool_invocation = row
        .get::<Option<String>, _>("tool_invocation_json")
        .map(|raw| parse_json::<ToolInvocationResult>("tool_invocation_json", &raw))
        .transpose()?;

    if matches!(role, MessageRole::Tool) && tool_invocation.is_none() {
        return Err(RepositoryError::Decode(
            "tool message without a tool invocation".to_string(),
        ));
    }

    Ok(Message {
        id: MessageId(row.get("id")),
        conversation_id: ConversationId(row.get("conversation_id")),
        role,
        body: row.get("body"),
        cleaned_text: row.get("cleaned_text"),
        tool_invocation,
        is_flagged_as_bad: row.get("is_flagged_as_bad"),
        flag_reason: row.get("flag_reason"),
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
    })
}
