//! Escalation detector: drives the conversation lifecycle machine and the
//! append-only escalation event log.
//!
//! Guard invariant: an escalation signal is never silently dropped. The
//! event is appended before ownership changes, and a persistence failure
//! propagates so the caller fails closed and sends no AI reply that turn.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use parley_core::domain::conversation::Conversation;
use parley_core::domain::escalation::{EscalationTrigger, NewEscalationEvent};
use parley_core::lifecycle::{self, ConversationState, LifecycleEvent, TransitionError};
use parley_db::repositories::{
    ConversationRepository, EscalationEventRepository, RepositoryError,
};

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("could not record escalation event: {0}")]
    EventPersistence(RepositoryError),
    #[error("could not update conversation ownership: {0}")]
    StatePersistence(RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Ownership transferred and exactly one event recorded.
    Escalated,
    /// The conversation was already human-owned; nothing was written.
    AlreadyEscalated,
}

pub struct EscalationDetector {
    conversations: Arc<dyn ConversationRepository>,
    events: Arc<dyn EscalationEventRepository>,
}

impl EscalationDetector {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        events: Arc<dyn EscalationEventRepository>,
    ) -> Self {
        Self { conversations, events }
    }

    pub async fn escalate(
        &self,
        conversation: &Conversation,
        trigger: EscalationTrigger,
        reason: Option<String>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let current = ConversationState {
            status: conversation.status,
            assignee: conversation.assignee.clone(),
        };
        let outcome = lifecycle::apply(&current, &LifecycleEvent::Escalate(trigger))?;

        let Some(recorded_trigger) = outcome.record_escalation else {
            return Ok(EscalationOutcome::AlreadyEscalated);
        };

        // Event first: if this fails we must not transfer ownership and the
        // caller must not send an AI reply.
        self.events
            .append(NewEscalationEvent {
                conversation_id: conversation.id,
                reason: reason.clone(),
                triggered_by: recorded_trigger,
            })
            .await
            .map_err(EscalationError::EventPersistence)?;

        self.conversations
            .update_state(&conversation.id, outcome.to.status, &outcome.to.assignee)
            .await
            .map_err(EscalationError::StatePersistence)?;

        info!(
            event_name = "engine.escalation.transferred",
            conversation_slug = %conversation.slug.0,
            trigger = recorded_trigger.as_str(),
            reason = reason.as_deref().unwrap_or(""),
            "conversation transferred to human ownership"
        );

        Ok(EscalationOutcome::Escalated)
    }
}
