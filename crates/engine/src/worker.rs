//! Background worker draining the fanout outbox.
//!
//! Jobs run decoupled from the request that enqueued them: a slow
//! notification path or summary regeneration never delays the HTTP
//! response. Failures are retried with linear backoff up to the job's
//! attempt budget, then parked as failed - never surfaced to the
//! conversation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use parley_core::domain::conversation::{Conversation, ConversationId, ConversationSlug};
use parley_core::domain::message::MessageRole;
use parley_core::domain::notification::NewMessageNotification;
use parley_core::domain::outbox::{OutboxJob, OutboxJobKind};
use parley_db::repositories::{
    ConversationRepository, MessageRepository, NotificationRepository, OutboxRepository,
};

use crate::fanout::{
    BroadcastListPayload, BroadcastMessagePayload, CreateNotificationPayload,
    RegenerateSubjectPayload, RegenerateSummaryPayload,
};
use crate::model::{ChatTurn, ModelOutcome, ModelProvider, ModelRequest};
use crate::prompts::{SUBJECT_PROMPT, SUMMARY_PROMPT};
use crate::realtime::{conversation_channel, RealtimePublisher, CONVERSATION_LIST_CHANNEL};

const MAX_VERBATIM_SUBJECT_CHARS: usize = 50;
const MAX_SUMMARY_BULLETS: usize = 3;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub retry_base_delay_secs: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            retry_base_delay_secs: 5,
        }
    }
}

pub struct OutboxWorker {
    outbox: Arc<dyn OutboxRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    notifications: Arc<dyn NotificationRepository>,
    publisher: Arc<dyn RealtimePublisher>,
    model: Arc<dyn ModelProvider>,
    settings: WorkerSettings,
}

pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        notifications: Arc<dyn NotificationRepository>,
        publisher: Arc<dyn RealtimePublisher>,
        model: Arc<dyn ModelProvider>,
        settings: WorkerSettings,
    ) -> Self {
        Self { outbox, conversations, messages, notifications, publisher, model, settings }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let poll_interval = self.settings.poll_interval;
        let handle = tokio::spawn(async move {
            info!(event_name = "engine.worker.started", "outbox worker started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {
                        self.drain_once().await;
                    }
                }
            }
            info!(event_name = "engine.worker.stopped", "outbox worker stopped");
        });
        WorkerHandle { shutdown, handle }
    }

    /// Claims and processes one batch of due jobs. Returns how many jobs
    /// were claimed.
    pub async fn drain_once(&self) -> usize {
        let now = Utc::now();
        let jobs = match self.outbox.claim_due(now, self.settings.batch_size).await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(
                    event_name = "engine.worker.claim_failed",
                    error = %error,
                    "could not claim outbox jobs"
                );
                return 0;
            }
        };

        let claimed = jobs.len();
        for job in jobs {
            match self.process(&job).await {
                Ok(()) => {
                    if let Err(error) = self.outbox.mark_completed(&job.id).await {
                        warn!(
                            event_name = "engine.worker.complete_failed",
                            error = %error,
                            job_id = %job.id.0,
                            "could not mark job completed"
                        );
                    }
                }
                Err(reason) => self.record_failure(&job, &reason).await,
            }
        }
        claimed
    }

    async fn record_failure(&self, job: &OutboxJob, reason: &str) {
        warn!(
            event_name = "engine.worker.job_failed",
            job_id = %job.id.0,
            kind = job.kind.as_str(),
            attempts = job.attempts,
            error = reason,
            "outbox job failed"
        );

        let result = if job.attempts >= job.max_attempts {
            self.outbox.mark_failed(&job.id, reason).await
        } else {
            let delay = chrono::Duration::seconds(
                self.settings.retry_base_delay_secs * i64::from(job.attempts),
            );
            self.outbox.mark_retry(&job.id, reason, Utc::now() + delay).await
        };
        if let Err(error) = result {
            warn!(
                event_name = "engine.worker.failure_record_failed",
                error = %error,
                job_id = %job.id.0,
                "could not record job failure"
            );
        }
    }

    async fn process(&self, job: &OutboxJob) -> Result<(), String> {
        match job.kind {
            OutboxJobKind::BroadcastMessage => {
                let payload: BroadcastMessagePayload = decode(&job.payload_json)?;
                let channel =
                    conversation_channel(&ConversationSlug(payload.conversation_slug.clone()));
                self.publisher
                    .publish(
                        &channel,
                        "message.created",
                        serde_json::json!({
                            "conversationSlug": payload.conversation_slug,
                            "messageId": payload.message_id,
                        }),
                    )
                    .await
                    .map_err(|error| error.to_string())
            }
            OutboxJobKind::BroadcastConversationList => {
                let payload: BroadcastListPayload = decode(&job.payload_json)?;
                self.publisher
                    .publish(
                        CONVERSATION_LIST_CHANNEL,
                        "conversation.statusChanged",
                        serde_json::json!({
                            "conversationSlug": payload.conversation_slug,
                            "status": payload.status,
                        }),
                    )
                    .await
                    .map_err(|error| error.to_string())
            }
            OutboxJobKind::RegenerateSubject => {
                let payload: RegenerateSubjectPayload = decode(&job.payload_json)?;
                self.regenerate_subject(ConversationId(payload.conversation_id)).await
            }
            OutboxJobKind::RegenerateSummary => {
                let payload: RegenerateSummaryPayload = decode(&job.payload_json)?;
                self.regenerate_summary(ConversationId(payload.conversation_id)).await
            }
            OutboxJobKind::CreateNotification => {
                let payload: CreateNotificationPayload = decode(&job.payload_json)?;
                self.notifications
                    .create(NewMessageNotification {
                        message_id: job.message_id,
                        conversation_id: ConversationId(payload.conversation_id),
                        customer_email: payload.customer_email,
                        notification_text: payload.notification_text,
                    })
                    .await
                    .map(|_created| ())
                    .map_err(|error| error.to_string())
            }
        }
    }

    async fn regenerate_subject(&self, id: ConversationId) -> Result<(), String> {
        let conversation = self.load_conversation(&id).await?;
        let first = self
            .messages
            .first_user_message(&id)
            .await
            .map_err(|error| error.to_string())?;
        let Some(first) = first else {
            // Nothing to derive a subject from yet.
            return Ok(());
        };

        // Short first messages become the subject verbatim; longer ones go
        // through the model.
        let subject = if first.cleaned_text.chars().count() <= MAX_VERBATIM_SUBJECT_CHARS {
            first.cleaned_text.clone()
        } else {
            let outcome = self
                .model
                .complete(&ModelRequest {
                    turns: vec![
                        ChatTurn::System(SUBJECT_PROMPT.to_string()),
                        ChatTurn::User(first.cleaned_text.clone()),
                    ],
                    tools: Vec::new(),
                })
                .await
                .map_err(|error| error.to_string())?;
            match outcome {
                ModelOutcome::Text(text) => text.trim().to_string(),
                ModelOutcome::ToolCall { .. } => {
                    return Err("subject generation returned a tool call".to_string());
                }
            }
        };

        if subject.is_empty() || subject == conversation.subject {
            return Ok(());
        }
        self.conversations
            .update_subject(&id, &subject)
            .await
            .map_err(|error| error.to_string())
    }

    async fn regenerate_summary(&self, id: ConversationId) -> Result<(), String> {
        let _ = self.load_conversation(&id).await?;
        let messages = self
            .messages
            .list_for_conversation(&id)
            .await
            .map_err(|error| error.to_string())?;

        let transcript: Vec<String> = messages
            .iter()
            .filter(|message| !message.cleaned_text.is_empty())
            .map(|message| {
                let speaker = match message.role {
                    MessageRole::User => "Customer",
                    _ => "Agent",
                };
                format!("{speaker}: {}", message.cleaned_text)
            })
            .collect();
        if transcript.is_empty() {
            return Ok(());
        }

        let outcome = self
            .model
            .complete(&ModelRequest {
                turns: vec![
                    ChatTurn::System(SUMMARY_PROMPT.to_string()),
                    ChatTurn::User(transcript.join("\n")),
                ],
                tools: Vec::new(),
            })
            .await
            .map_err(|error| error.to_string())?;

        let text = match outcome {
            ModelOutcome::Text(text) => text,
            ModelOutcome::ToolCall { .. } => {
                return Err("summary generation returned a tool call".to_string());
            }
        };

        let bullets: Vec<String> = text
            .lines()
            .map(|line| line.trim_start_matches(['-', '*', '•', ' ']).trim().to_string())
            .filter(|line| !line.is_empty())
            .take(MAX_SUMMARY_BULLETS)
            .collect();
        if bullets.is_empty() {
            return Ok(());
        }

        self.conversations
            .update_summary(&id, &bullets)
            .await
            .map_err(|error| error.to_string())
    }

    async fn load_conversation(&self, id: &ConversationId) -> Result<Conversation, String> {
        self.conversations
            .find_by_id(id)
            .await
            .map_err(|error| error.to_string())?
            .ok_or_else(|| format!("conversation {} not found", id.0))
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload_json: &str) -> Result<T, String> {
    serde_json::from_str(payload_json)
        .map_err(|error| format!("could not decode job payload: {error}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use parley_core::domain::conversation::NewConversation;
    use parley_core::domain::message::{MessageRole, NewMessage};
    use parley_core::domain::outbox::{OutboxJob, OutboxJobKind, OutboxJobState};
    use parley_db::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryMessageRepository,
        InMemoryNotificationRepository, InMemoryOutboxRepository, MessageRepository,
        NotificationRepository, OutboxRepository,
    };

    use super::{OutboxWorker, WorkerSettings};
    use crate::model::{ModelError, ModelOutcome, ModelProvider, ModelRequest};
    use crate::realtime::InMemoryPublisher;

    struct TextModel {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelProvider for TextModel {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelOutcome, ModelError> {
            let mut replies = self.replies.lock().await;
            if replies.is_empty() {
                return Err(ModelError::Transport("no reply scripted".to_string()));
            }
            Ok(ModelOutcome::Text(replies.remove(0)))
        }
    }

    struct Fixture {
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
        notifications: Arc<InMemoryNotificationRepository>,
        outbox: Arc<InMemoryOutboxRepository>,
        publisher: Arc<InMemoryPublisher>,
        worker: OutboxWorker,
    }

    fn fixture(replies: Vec<&str>) -> Fixture {
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let notifications = Arc::new(InMemoryNotificationRepository::default());
        let outbox = Arc::new(InMemoryOutboxRepository::default());
        let publisher = Arc::new(InMemoryPublisher::default());
        let model = Arc::new(TextModel {
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
        });

        let worker = OutboxWorker::new(
            outbox.clone(),
            conversations.clone(),
            messages.clone(),
            notifications.clone(),
            publisher.clone(),
            model,
            WorkerSettings::default(),
        );
        Fixture { conversations, messages, notifications, outbox, publisher, worker }
    }

    #[tokio::test]
    async fn broadcast_jobs_publish_to_the_conversation_channel() {
        let fixture = fixture(Vec::new());
        let job = OutboxJob::enqueue(
            parley_core::domain::message::MessageId(7),
            OutboxJobKind::BroadcastMessage,
            serde_json::json!({"conversation_slug": "abc", "message_id": 7}).to_string(),
            3,
        );
        fixture.outbox.enqueue(job.clone()).await.expect("enqueue");

        assert_eq!(fixture.worker.drain_once().await, 1);

        let events = fixture.publisher.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, "conversation/abc");
        assert_eq!(events[0].event, "message.created");

        let done = fixture.outbox.find_by_id(&job.id).await.expect("find").expect("present");
        assert_eq!(done.state, OutboxJobState::Completed);
    }

    #[tokio::test]
    async fn short_first_message_becomes_the_subject_verbatim() {
        let fixture = fixture(Vec::new());
        let conversation = fixture
            .conversations
            .create(NewConversation::inbound(None))
            .await
            .expect("create");
        let message = fixture
            .messages
            .insert(NewMessage::text(conversation.id, MessageRole::User, "refund for order #123"))
            .await
            .expect("insert");

        fixture
            .outbox
            .enqueue(OutboxJob::enqueue(
                message.id,
                OutboxJobKind::RegenerateSubject,
                serde_json::json!({"conversation_id": conversation.id.0}).to_string(),
                3,
            ))
            .await
            .expect("enqueue");
        fixture.worker.drain_once().await;

        let updated = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(updated.subject, "refund for order #123");
    }

    #[tokio::test]
    async fn long_first_message_goes_through_the_model() {
        let fixture = fixture(vec!["Refund request for order #123"]);
        let conversation = fixture
            .conversations
            .create(NewConversation::inbound(None))
            .await
            .expect("create");
        let long_body = "I bought the premium plan two months ago and it has never worked \
                         properly, I would like to understand how to get my money back please";
        let message = fixture
            .messages
            .insert(NewMessage::text(conversation.id, MessageRole::User, long_body))
            .await
            .expect("insert");

        fixture
            .outbox
            .enqueue(OutboxJob::enqueue(
                message.id,
                OutboxJobKind::RegenerateSubject,
                serde_json::json!({"conversation_id": conversation.id.0}).to_string(),
                3,
            ))
            .await
            .expect("enqueue");
        fixture.worker.drain_once().await;

        let updated = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(updated.subject, "Refund request for order #123");
    }

    #[tokio::test]
    async fn summary_regeneration_stores_at_most_three_bullets() {
        let fixture = fixture(vec![
            "- Customer could not log in\n- Password reset link was sent\n- Waiting for confirmation\n- extra line that is dropped",
        ]);
        let conversation = fixture
            .conversations
            .create(NewConversation::inbound(None))
            .await
            .expect("create");
        let message = fixture
            .messages
            .insert(NewMessage::text(conversation.id, MessageRole::User, "cannot log in"))
            .await
            .expect("insert");

        fixture
            .outbox
            .enqueue(OutboxJob::enqueue(
                message.id,
                OutboxJobKind::RegenerateSummary,
                serde_json::json!({"conversation_id": conversation.id.0}).to_string(),
                3,
            ))
            .await
            .expect("enqueue");
        fixture.worker.drain_once().await;

        let updated = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");
        let summary = updated.summary.expect("summary stored");
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0], "Customer could not log in");
    }

    #[tokio::test]
    async fn notification_jobs_create_exactly_one_record() {
        let fixture = fixture(Vec::new());
        let conversation = fixture
            .conversations
            .create(NewConversation::inbound(Some("ada@example.com".to_string())))
            .await
            .expect("create");

        let payload = serde_json::json!({
            "conversation_id": conversation.id.0,
            "customer_email": "ada@example.com",
            "notification_text": "You have a new reply",
        })
        .to_string();
        fixture
            .outbox
            .enqueue(OutboxJob::enqueue(
                parley_core::domain::message::MessageId(42),
                OutboxJobKind::CreateNotification,
                payload,
                3,
            ))
            .await
            .expect("enqueue");
        fixture.worker.drain_once().await;

        let listed = fixture
            .notifications
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].notification_text, "You have a new reply");
    }

    #[tokio::test]
    async fn failing_jobs_retry_until_the_attempt_budget_then_park() {
        let fixture = fixture(Vec::new());
        // Missing conversation: regeneration fails every attempt.
        let job = OutboxJob::enqueue(
            parley_core::domain::message::MessageId(9),
            OutboxJobKind::RegenerateSubject,
            serde_json::json!({"conversation_id": 999}).to_string(),
            2,
        );
        fixture.outbox.enqueue(job.clone()).await.expect("enqueue");

        fixture.worker.drain_once().await;
        let after_first = fixture.outbox.find_by_id(&job.id).await.expect("find").expect("present");
        assert_eq!(after_first.state, OutboxJobState::Queued);
        assert_eq!(after_first.attempts, 1);

        // Fast-forward past the backoff by claiming at a later time: the
        // in-memory repository honors available_at.
        let retry_time = after_first.available_at + chrono::Duration::seconds(1);
        let reclaimed = fixture.outbox.claim_due(retry_time, 10).await.expect("claim");
        assert_eq!(reclaimed.len(), 1);
        fixture.worker.record_failure(&reclaimed[0], "still missing").await;

        let parked = fixture.outbox.find_by_id(&job.id).await.expect("find").expect("present");
        assert_eq!(parked.state, OutboxJobState::Failed);
    }
}
