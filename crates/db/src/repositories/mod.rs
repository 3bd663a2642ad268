use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use parley_core::domain::conversation::{
    Assignee, Conversation, ConversationId, ConversationSlug, ConversationStatus, NewConversation,
};
use parley_core::domain::embedding::EmbeddingCacheEntry;
use parley_core::domain::escalation::{EscalationEvent, NewEscalationEvent};
use parley_core::domain::knowledge::KnowledgeBankEntry;
use parley_core::domain::message::{Message, MessageId, NewMessage};
use parley_core::domain::notification::{MessageNotification, NewMessageNotification};
use parley_core::domain::outbox::{OutboxJob, OutboxJobId};
use parley_core::domain::tool::ToolDefinition;

pub mod conversation;
pub mod embedding_cache;
pub mod escalation;
pub mod knowledge;
pub mod memory;
pub mod message;
pub mod notification;
pub mod outbox;
pub mod tool;

pub use conversation::SqlConversationRepository;
pub use embedding_cache::SqlEmbeddingStore;
pub use escalation::SqlEscalationEventRepository;
pub use knowledge::SqlKnowledgeBankRepository;
pub use memory::{
    InMemoryConversationRepository, InMemoryEmbeddingStore, InMemoryEscalationEventRepository,
    InMemoryKnowledgeBankRepository, InMemoryMessageRepository, InMemoryNotificationRepository,
    InMemoryOutboxRepository, InMemoryToolRepository,
};
pub use message::SqlMessageRepository;
pub use notification::SqlNotificationRepository;
pub use outbox::SqlOutboxRepository;
pub use tool::SqlToolRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: &str,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("column `{column}`: {error}")))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("column `{column}`: {error}")))
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, RepositoryError>;

    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn find_by_slug(
        &self,
        slug: &ConversationSlug,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn update_state(
        &self,
        id: &ConversationId,
        status: ConversationStatus,
        assignee: &Assignee,
    ) -> Result<(), RepositoryError>;

    async fn update_subject(
        &self,
        id: &ConversationId,
        subject: &str,
    ) -> Result<(), RepositoryError>;

    async fn update_summary(
        &self,
        id: &ConversationId,
        summary: &[String],
    ) -> Result<(), RepositoryError>;

    async fn update_embedding(
        &self,
        id: &ConversationId,
        embedding: &[f32],
    ) -> Result<(), RepositoryError>;

    /// Similarity search over closed conversations with stored embeddings,
    /// strictly above `threshold`, descending, capped at `limit`.
    async fn find_similar_closed(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        exclude: Option<&ConversationSlug>,
    ) -> Result<Vec<(Conversation, f32)>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, message: NewMessage) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError>;

    /// Ordered by creation time, then id, for verbatim replay into model
    /// turns.
    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn count_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<u64, RepositoryError>;

    async fn first_user_message(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Message>, RepositoryError>;

    /// The only mutation allowed after insert: the moderation flag pair.
    async fn set_flagged(
        &self,
        id: &MessageId,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait KnowledgeBankRepository: Send + Sync {
    async fn insert(&self, entry: KnowledgeBankEntry) -> Result<(), RepositoryError>;

    /// Similarity search over enabled entries, strictly above `threshold`,
    /// descending, capped at `limit`.
    async fn find_similar_enabled(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(KnowledgeBankEntry, f32)>, RepositoryError>;
}

#[async_trait]
pub trait EscalationEventRepository: Send + Sync {
    /// Append-only. A failure here must propagate: the orchestrator fails
    /// closed rather than dropping an escalation signal.
    async fn append(
        &self,
        event: NewEscalationEvent,
    ) -> Result<EscalationEvent, RepositoryError>;

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<EscalationEvent>, RepositoryError>;
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Expired entries report a miss.
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingCacheEntry>, RepositoryError>;

    async fn put(&self, entry: EmbeddingCacheEntry) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ToolRepository: Send + Sync {
    async fn upsert(&self, tool: ToolDefinition) -> Result<(), RepositoryError>;

    async fn find_by_slug(&self, slug: &str) -> Result<Option<ToolDefinition>, RepositoryError>;

    async fn list_chat_tools(&self) -> Result<Vec<ToolDefinition>, RepositoryError>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Returns false when a job for the same (message_id, kind) already
    /// exists; redelivery of the same event is a no-op.
    async fn enqueue(&self, job: OutboxJob) -> Result<bool, RepositoryError>;

    /// Claims up to `limit` due jobs, marking them running and bumping the
    /// attempt counter.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxJob>, RepositoryError>;

    async fn mark_completed(&self, id: &OutboxJobId) -> Result<(), RepositoryError>;

    /// Requeues a failed attempt for a later retry.
    async fn mark_retry(
        &self,
        id: &OutboxJobId,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn mark_failed(&self, id: &OutboxJobId, error: &str) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &OutboxJobId) -> Result<Option<OutboxJob>, RepositoryError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Returns false when a notification for the message already exists.
    async fn create(
        &self,
        notification: NewMessageNotification,
    ) -> Result<bool, RepositoryError>;

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageNotification>, RepositoryError>;
}
