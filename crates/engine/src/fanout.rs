//! Event fanout: decides which side effects one terminal message needs and
//! enqueues them as typed outbox jobs keyed by (message id, kind).
//!
//! Enqueueing is inline but execution is not - the worker (`worker`) drains
//! the queue in the background, so none of these steps can delay the HTTP
//! response. Enqueue failures are logged and swallowed; fanout never
//! surfaces an error to the conversation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use parley_core::domain::conversation::{Conversation, PLACEHOLDER_SUBJECT};
use parley_core::domain::message::{Message, MessageRole};
use parley_core::domain::outbox::{OutboxJob, OutboxJobKind};
use parley_core::text::normalized_contains;
use parley_db::repositories::{MessageRepository, OutboxRepository};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastMessagePayload {
    pub conversation_slug: String,
    pub message_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastListPayload {
    pub conversation_slug: String,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegenerateSubjectPayload {
    pub conversation_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegenerateSummaryPayload {
    pub conversation_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateNotificationPayload {
    pub conversation_id: i64,
    pub customer_email: String,
    pub notification_text: String,
}

/// Per-turn facts the predicates need but the message itself doesn't carry.
#[derive(Clone, Debug, Default)]
pub struct FanoutContext {
    pub is_new_conversation: bool,
    pub reopened: bool,
    pub escalated: bool,
    /// Conversation originated from a prompt surface; its subject tracks
    /// the first message.
    pub is_prompt_originated: bool,
    pub customer_has_unread: bool,
}

pub struct EventFanout {
    outbox: Arc<dyn OutboxRepository>,
    messages: Arc<dyn MessageRepository>,
    summary_message_threshold: usize,
    max_attempts: u32,
}

impl EventFanout {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        messages: Arc<dyn MessageRepository>,
        summary_message_threshold: usize,
        max_attempts: u32,
    ) -> Self {
        Self { outbox, messages, summary_message_threshold, max_attempts }
    }

    /// Evaluates every predicate independently and enqueues one job per
    /// satisfied one. Safe to call again for the same message: the outbox
    /// dedupes on (message id, kind).
    pub async fn dispatch(
        &self,
        conversation: &Conversation,
        message: &Message,
        context: &FanoutContext,
    ) {
        self.enqueue(
            message,
            OutboxJobKind::BroadcastMessage,
            &BroadcastMessagePayload {
                conversation_slug: conversation.slug.0.clone(),
                message_id: message.id.0,
            },
        )
        .await;

        if message.role == MessageRole::User
            && (context.is_new_conversation || context.reopened)
        {
            self.enqueue(
                message,
                OutboxJobKind::BroadcastConversationList,
                &BroadcastListPayload {
                    conversation_slug: conversation.slug.0.clone(),
                    status: conversation.status.as_str().to_string(),
                },
            )
            .await;
        }

        if self.needs_subject_regeneration(conversation, context).await {
            self.enqueue(
                message,
                OutboxJobKind::RegenerateSubject,
                &RegenerateSubjectPayload { conversation_id: conversation.id.0 },
            )
            .await;
        }

        if self.exceeds_summary_threshold(conversation).await {
            self.enqueue(
                message,
                OutboxJobKind::RegenerateSummary,
                &RegenerateSummaryPayload { conversation_id: conversation.id.0 },
            )
            .await;
        }

        if matches!(message.role, MessageRole::AiAssistant | MessageRole::Staff)
            && context.customer_has_unread
        {
            if let Some(customer_email) = &conversation.customer_email {
                self.enqueue(
                    message,
                    OutboxJobKind::CreateNotification,
                    &CreateNotificationPayload {
                        conversation_id: conversation.id.0,
                        customer_email: customer_email.clone(),
                        notification_text: format!(
                            "You have a new reply for {}",
                            conversation.subject
                        ),
                    },
                )
                .await;
            }
        }
    }

    async fn needs_subject_regeneration(
        &self,
        conversation: &Conversation,
        context: &FanoutContext,
    ) -> bool {
        if conversation.subject == PLACEHOLDER_SUBJECT || context.escalated {
            return true;
        }
        if !context.is_prompt_originated {
            return false;
        }
        match self.messages.first_user_message(&conversation.id).await {
            Ok(Some(first)) => !normalized_contains(&first.cleaned_text, &conversation.subject),
            Ok(None) => false,
            Err(error) => {
                warn!(
                    event_name = "engine.fanout.subject_check_failed",
                    error = %error,
                    conversation_slug = %conversation.slug.0,
                    "could not check subject freshness"
                );
                false
            }
        }
    }

    async fn exceeds_summary_threshold(&self, conversation: &Conversation) -> bool {
        match self.messages.count_for_conversation(&conversation.id).await {
            Ok(count) => count as usize > self.summary_message_threshold,
            Err(error) => {
                warn!(
                    event_name = "engine.fanout.count_failed",
                    error = %error,
                    conversation_slug = %conversation.slug.0,
                    "could not count messages for summary threshold"
                );
                false
            }
        }
    }

    async fn enqueue<P: Serialize>(&self, message: &Message, kind: OutboxJobKind, payload: &P) {
        let payload_json = match serde_json::to_string(payload) {
            Ok(payload_json) => payload_json,
            Err(error) => {
                warn!(
                    event_name = "engine.fanout.encode_failed",
                    error = %error,
                    kind = kind.as_str(),
                    "could not encode fanout payload"
                );
                return;
            }
        };

        let job = OutboxJob::enqueue(message.id, kind, payload_json, self.max_attempts);
        match self.outbox.enqueue(job).await {
            Ok(_inserted) => {}
            Err(error) => {
                warn!(
                    event_name = "engine.fanout.enqueue_failed",
                    error = %error,
                    kind = kind.as_str(),
                    message_id = message.id.0,
                    "could not enqueue fanout job"
                );
            }
        }
    }
}
