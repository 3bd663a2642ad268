use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use parley_core::domain::conversation::{
    Assignee, Conversation, ConversationId, ConversationSlug, ConversationStatus, NewConversation,
};
use parley_core::domain::embedding::EmbeddingCacheEntry;
use parley_core::domain::escalation::{EscalationEvent, NewEscalationEvent};
use parley_core::domain::knowledge::KnowledgeBankEntry;
use parley_core::domain::message::{Message, MessageId, MessageRole, NewMessage};
use parley_core::domain::notification::{MessageNotification, NewMessageNotification};
use parley_core::domain::outbox::{OutboxJob, OutboxJobId, OutboxJobState};
use parley_core::domain::tool::ToolDefinition;
use parley_core::similarity::rank_by_similarity;

use super::{
    ConversationRepository, EmbeddingStore, EscalationEventRepository, KnowledgeBankRepository,
    MessageRepository, NotificationRepository, OutboxRepository, RepositoryError, ToolRepository,
};

#[derive(Default)]
struct ConversationTable {
    next_id: i64,
    rows: HashMap<i64, Conversation>,
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    table: RwLock<ConversationTable>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn create(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, RepositoryError> {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let now = Utc::now();
        let created = Conversation {
            id: ConversationId(table.next_id),
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
        };
        table.rows.insert(created.id.0, created.clone());
        Ok(created)
    }

    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.table.read().await.rows.get(&id.0).cloned())
    }

    async fn find_by_slug(
        &self,
        slug: &ConversationSlug,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .values()
            .find(|conversation| &conversation.slug == slug)
            .cloned())
    }

    async fn update_state(
        &self,
        id: &ConversationId,
        status: ConversationStatus,
        assignee: &Assignee,
    ) -> Result<(), RepositoryError> {
        let mut table = self.table.write().await;
        let conversation = table
            .rows
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {}", id.0)))?;
        conversation.status = status;
        conversation.assignee = assignee.clone();
        conversation.updated_at = Utc::now();
        conversation.closed_at = match status {
            ConversationStatus::Closed => conversation.closed_at.or(Some(Utc::now())),
            _ => None,
        };
        Ok(())
    }

    async fn update_subject(
        &self,
        id: &ConversationId,
        subject: &str,
    ) -> Result<(), RepositoryError> {
        let mut table = self.table.write().await;
        let conversation = table
            .rows
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {}", id.0)))?;
        conversation.subject = subject.to_string();
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn update_summary(
        &self,
        id: &ConversationId,
        summary: &[String],
    ) -> Result<(), RepositoryError> {
        let mut table = self.table.write().await;
        let conversation = table
            .rows
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {}", id.0)))?;
        conversation.summary = Some(summary.to_vec());
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn update_embedding(
        &self,
        id: &ConversationId,
        embedding: &[f32],
    ) -> Result<(), RepositoryError> {
        let mut table = self.table.write().await;
        let conversation = table
            .rows
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {}", id.0)))?;
        conversation.embedding = Some(embedding.to_vec());
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn find_similar_closed(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        exclude: Option<&ConversationSlug>,
    ) -> Result<Vec<(Conversation, f32)>, RepositoryError> {
        let table = self.table.read().await;
        let candidates = table
            .rows
            .values()
            .filter(|conversation| {
                conversation.status == ConversationStatus::Closed
                    && !exclude.is_some_and(|slug| slug == &conversation.slug)
            })
            .filter_map(|conversation| {
                conversation
                    .embedding
                    .clone()
                    .map(|stored| (conversation.clone(), stored))
            })
            .collect::<Vec<_>>();
        Ok(rank_by_similarity(embedding, candidates, threshold, limit))
    }
}

#[derive(Default)]
struct MessageTable {
    next_id: i64,
    rows: Vec<Message>,
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    table: RwLock<MessageTable>,
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn insert(&self, message: NewMessage) -> Result<Message, RepositoryError> {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let inserted = Message {
            id: MessageId(table.next_id),
            conversation_id: message.conversation_id,
            role: message.role,
            body: message.body,
            cleaned_text: message.cleaned_text,
            tool_invocation: message.tool_invocation,
            is_flagged_as_bad: false,
            flag_reason: None,
            created_at: Utc::now(),
        };
        table.rows.push(inserted.clone());
        Ok(inserted)
    }

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .iter()
            .find(|message| message.id == *id)
            .cloned())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .iter()
            .filter(|message| message.conversation_id == *conversation_id)
            .cloned()
            .collect())
    }

    async fn count_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<u64, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .iter()
            .filter(|message| message.conversation_id == *conversation_id)
            .count() as u64)
    }

    async fn first_user_message(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Message>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .iter()
            .find(|message| {
                message.conversation_id == *conversation_id && message.role == MessageRole::User
            })
            .cloned())
    }

    async fn set_flagged(
        &self,
        id: &MessageId,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut table = self.table.write().await;
        let message = table
            .rows
            .iter_mut()
            .find(|message| message.id == *id)
            .ok_or_else(|| RepositoryError::NotFound(format!("message {}", id.0)))?;
        message.is_flagged_as_bad = true;
        message.flag_reason = reason.map(str::to_string);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryKnowledgeBankRepository {
    entries: RwLock<Vec<KnowledgeBankEntry>>,
}

#[async_trait::async_trait]
impl KnowledgeBankRepository for InMemoryKnowledgeBankRepository {
    async fn insert(&self, entry: KnowledgeBankEntry) -> Result<(), RepositoryError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn find_similar_enabled(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(KnowledgeBankEntry, f32)>, RepositoryError> {
        let candidates = self
            .entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| (entry.clone(), entry.embedding.clone()))
            .collect::<Vec<_>>();
        Ok(rank_by_similarity(embedding, candidates, threshold, limit))
    }
}

#[derive(Default)]
struct EscalationTable {
    next_id: i64,
    rows: Vec<EscalationEvent>,
}

#[derive(Default)]
pub struct InMemoryEscalationEventRepository {
    table: RwLock<EscalationTable>,
    fail_appends: std::sync::atomic::AtomicBool,
}

impl InMemoryEscalationEventRepository {
    /// Makes every subsequent append fail, for fail-closed tests.
    pub fn fail_appends(&self) {
        self.fail_appends.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl EscalationEventRepository for InMemoryEscalationEventRepository {
    async fn append(
        &self,
        event: NewEscalationEvent,
    ) -> Result<EscalationEvent, RepositoryError> {
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepositoryError::Decode("escalation event store unavailable".into()));
        }
        let mut table = self.table.write().await;
        table.next_id += 1;
        let appended = EscalationEvent {
            id: table.next_id,
            conversation_id: event.conversation_id,
            reason: event.reason,
            triggered_by: event.triggered_by,
            created_at: Utc::now(),
        };
        table.rows.push(appended.clone());
        Ok(appended)
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<EscalationEvent>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .iter()
            .filter(|event| event.conversation_id == *conversation_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryEmbeddingStore {
    entries: RwLock<HashMap<String, EmbeddingCacheEntry>>,
    fail_all: std::sync::atomic::AtomicBool,
}

impl InMemoryEmbeddingStore {
    /// Simulates an unavailable cache backend; the embedding service must
    /// degrade to direct computation.
    pub fn fail_all(&self) {
        self.fail_all.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingCacheEntry>, RepositoryError> {
        if self.fail_all.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepositoryError::Decode("cache backend unavailable".into()));
        }
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|entry| !entry.is_expired(now)).cloned())
    }

    async fn put(&self, entry: EmbeddingCacheEntry) -> Result<(), RepositoryError> {
        if self.fail_all.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepositoryError::Decode("cache backend unavailable".into()));
        }
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryToolRepository {
    tools: RwLock<HashMap<String, ToolDefinition>>,
}

#[async_trait::async_trait]
impl ToolRepository for InMemoryToolRepository {
    async fn upsert(&self, tool: ToolDefinition) -> Result<(), RepositoryError> {
        self.tools.write().await.insert(tool.slug.clone(), tool);
        Ok(())
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<ToolDefinition>, RepositoryError> {
        Ok(self.tools.read().await.get(slug).cloned())
    }

    async fn list_chat_tools(&self) -> Result<Vec<ToolDefinition>, RepositoryError> {
        let mut tools = self
            .tools
            .read()
            .await
            .values()
            .filter(|tool| tool.available_in_chat)
            .cloned()
            .collect::<Vec<_>>();
        tools.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(tools)
    }
}

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    jobs: RwLock<Vec<OutboxJob>>,
}

#[async_trait::async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn enqueue(&self, job: OutboxJob) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if jobs
            .iter()
            .any(|existing| existing.message_id == job.message_id && existing.kind == job.kind)
        {
            return Ok(false);
        }
        jobs.push(job);
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxJob>, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let mut claimed = Vec::new();
        for job in jobs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if job.state == OutboxJobState::Queued && job.available_at <= now {
                job.state = OutboxJobState::Running;
                job.attempts += 1;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, id: &OutboxJobId) -> Result<(), RepositoryError> {
        self.update(id, |job| {
            job.state = OutboxJobState::Completed;
            job.last_error = None;
        })
        .await
    }

    async fn mark_retry(
        &self,
        id: &OutboxJobId,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.update(id, |job| {
            job.state = OutboxJobState::Queued;
            job.last_error = Some(error.to_string());
            job.available_at = available_at;
        })
        .await
    }

    async fn mark_failed(&self, id: &OutboxJobId, error: &str) -> Result<(), RepositoryError> {
        self.update(id, |job| {
            job.state = OutboxJobState::Failed;
            job.last_error = Some(error.to_string());
        })
        .await
    }

    async fn find_by_id(&self, id: &OutboxJobId) -> Result<Option<OutboxJob>, RepositoryError> {
        Ok(self.jobs.read().await.iter().find(|job| job.id == *id).cloned())
    }
}

impl InMemoryOutboxRepository {
    async fn update(
        &self,
        id: &OutboxJobId,
        apply: impl FnOnce(&mut OutboxJob),
    ) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == *id)
            .ok_or_else(|| RepositoryError::NotFound(format!("outbox job {}", id.0)))?;
        apply(job);
        job.updated_at = Utc::now();
        Ok(())
    }

    pub async fn all(&self) -> Vec<OutboxJob> {
        self.jobs.read().await.clone()
    }
}

#[derive(Default)]
struct NotificationTable {
    next_id: i64,
    rows: Vec<MessageNotification>,
}

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    table: RwLock<NotificationTable>,
}

#[async_trait::async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(
        &self,
        notification: NewMessageNotification,
    ) -> Result<bool, RepositoryError> {
        let mut table = self.table.write().await;
        if table.rows.iter().any(|existing| existing.message_id == notification.message_id) {
            return Ok(false);
        }
        table.next_id += 1;
        let row = MessageNotification {
            id: table.next_id,
            message_id: notification.message_id,
            conversation_id: notification.conversation_id,
            customer_email: notification.customer_email,
            notification_text: notification.notification_text,
            created_at: Utc::now(),
        };
        table.rows.push(row);
        Ok(true)
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageNotification>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .iter()
            .filter(|notification| notification.conversation_id == *conversation_id)
            .cloned()
            .collect())
    }
}
