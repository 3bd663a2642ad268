//! Conversation lifecycle state machine.
//!
//! Ownership and status transitions are enumerated here so that illegal
//! combinations (a conversation both AI-owned and human-owned, an AI
//! marking spam) are unrepresentable or rejected, never silently stored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::{Assignee, ConversationStatus, UserId};
use crate::domain::escalation::EscalationTrigger;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub status: ConversationStatus,
    pub assignee: Assignee,
}

impl ConversationState {
    pub fn open_ai() -> Self {
        Self { status: ConversationStatus::Open, assignee: Assignee::Ai }
    }

    pub fn open_human(user: Option<UserId>) -> Self {
        Self { status: ConversationStatus::Open, assignee: Assignee::Human(user) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Transfer ownership to a human. Idempotent on an already
    /// human-owned open conversation.
    Escalate(EscalationTrigger),
    /// AI closes the conversation after producing a terminal resolution.
    AutoClose,
    /// Operator closes the conversation.
    Close { by_user: UserId },
    /// Operator marks the conversation as spam. Never available to the AI.
    MarkSpam { by_user: Option<UserId> },
    /// Undo a close/spam action. `recovered` is the pre-transition
    /// assignee when the event log can reconstruct it.
    Reopen { recovered: Option<Assignee> },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot escalate a {status:?} conversation")]
    EscalateUnavailable { status: ConversationStatus },
    #[error("auto-close requires an open, AI-owned conversation (was {status:?}, ai={ai})")]
    AutoCloseUnavailable { status: ConversationStatus, ai: bool },
    #[error("only operators may mark a conversation as spam")]
    SpamRequiresOperator,
    #[error("cannot {action} a {status:?} conversation")]
    InvalidStatus { action: &'static str, status: ConversationStatus },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: ConversationState,
    pub to: ConversationState,
    /// Set when the transition must append an escalation event. A no-op
    /// re-trigger leaves this empty, which is what makes escalation
    /// idempotent at the event-log level.
    pub record_escalation: Option<EscalationTrigger>,
}

impl TransitionOutcome {
    pub fn is_noop(&self) -> bool {
        self.from == self.to && self.record_escalation.is_none()
    }
}

pub fn apply(
    current: &ConversationState,
    event: &LifecycleEvent,
) -> Result<TransitionOutcome, TransitionError> {
    match event {
        LifecycleEvent::Escalate(trigger) => escalate(current, *trigger),
        LifecycleEvent::AutoClose => auto_close(current),
        LifecycleEvent::Close { .. } => close(current),
        LifecycleEvent::MarkSpam { by_user } => mark_spam(current, by_user.as_ref()),
        LifecycleEvent::Reopen { recovered } => reopen(current, recovered.clone()),
    }
}

fn escalate(
    current: &ConversationState,
    trigger: EscalationTrigger,
) -> Result<TransitionOutcome, TransitionError> {
    match (&current.status, &current.assignee) {
        (ConversationStatus::Open, Assignee::Ai) => Ok(TransitionOutcome {
            from: current.clone(),
            to: ConversationState::open_human(None),
            record_escalation: Some(trigger),
        }),
        // Already with a human: the second occurrence of the same signal
        // must not produce a second event or transition.
        (ConversationStatus::Open, Assignee::Human(_)) => Ok(TransitionOutcome {
            from: current.clone(),
            to: current.clone(),
            record_escalation: None,
        }),
        // An escalation signal on a closed conversation reopens it for a
        // human; spam stays spam.
        (ConversationStatus::Closed, _) => Ok(TransitionOutcome {
            from: current.clone(),
            to: ConversationState::open_human(None),
            record_escalation: Some(trigger),
        }),
        (ConversationStatus::Spam, _) => {
            Err(TransitionError::EscalateUnavailable { status: current.status })
        }
    }
}

fn auto_close(current: &ConversationState) -> Result<TransitionOutcome, TransitionError> {
    match (&current.status, &current.assignee) {
        (ConversationStatus::Open, Assignee::Ai) => Ok(TransitionOutcome {
            from: current.clone(),
            to: ConversationState { status: ConversationStatus::Closed, assignee: Assignee::Ai },
            record_escalation: None,
        }),
        _ => Err(TransitionError::AutoCloseUnavailable {
            status: current.status,
            ai: current.assignee.is_ai(),
        }),
    }
}

fn close(current: &ConversationState) -> Result<TransitionOutcome, TransitionError> {
    match current.status {
        ConversationStatus::Open => Ok(TransitionOutcome {
            from: current.clone(),
            to: ConversationState {
                status: ConversationStatus::Closed,
                assignee: current.assignee.clone(),
            },
            record_escalation: None,
        }),
        status => Err(TransitionError::InvalidStatus { action: "close", status }),
    }
}

fn mark_spam(
    current: &ConversationState,
    by_user: Option<&UserId>,
) -> Result<TransitionOutcome, TransitionError> {
    if by_user.is_none() {
        return Err(TransitionError::SpamRequiresOperator);
    }
    match current.status {
        ConversationStatus::Open => Ok(TransitionOutcome {
            from: current.clone(),
            to: ConversationState {
                status: ConversationStatus::Spam,
                assignee: current.assignee.clone(),
            },
            record_escalation: None,
        }),
        status => Err(TransitionError::InvalidStatus { action: "mark spam", status }),
    }
}

fn reopen(
    current: &ConversationState,
    recovered: Option<Assignee>,
) -> Result<TransitionOutcome, TransitionError> {
    match current.status {
        ConversationStatus::Closed | ConversationStatus::Spam => Ok(TransitionOutcome {
            from: current.clone(),
            to: ConversationState {
                status: ConversationStatus::Open,
                // Fail safe toward human visibility when the prior owner
                // cannot be reconstructed.
                assignee: recovered.unwrap_or(Assignee::Human(None)),
            },
            record_escalation: None,
        }),
        ConversationStatus::Open => {
            Err(TransitionError::InvalidStatus { action: "reopen", status: current.status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{apply, ConversationState, LifecycleEvent, TransitionError};
    use crate::domain::conversation::{Assignee, ConversationStatus, UserId};
    use crate::domain::escalation::EscalationTrigger;

    #[test]
    fn escalation_transfers_ownership_and_records_one_event() {
        let outcome = apply(
            &ConversationState::open_ai(),
            &LifecycleEvent::Escalate(EscalationTrigger::ExplicitToolCall),
        )
        .expect("escalate");

        assert_eq!(outcome.to, ConversationState::open_human(None));
        assert_eq!(outcome.record_escalation, Some(EscalationTrigger::ExplicitToolCall));
    }

    #[test]
    fn second_escalation_is_a_noop() {
        let escalated = ConversationState::open_human(None);
        let outcome = apply(
            &escalated,
            &LifecycleEvent::Escalate(EscalationTrigger::HumanReply),
        )
        .expect("re-escalate");

        assert!(outcome.is_noop());
        assert_eq!(outcome.to, escalated);
    }

    #[test]
    fn escalation_reopens_a_closed_conversation() {
        let closed = ConversationState {
            status: ConversationStatus::Closed,
            assignee: Assignee::Ai,
        };
        let outcome = apply(
            &closed,
            &LifecycleEvent::Escalate(EscalationTrigger::BadFlag),
        )
        .expect("escalate closed");
        assert_eq!(outcome.to, ConversationState::open_human(None));
        assert_eq!(outcome.record_escalation, Some(EscalationTrigger::BadFlag));
    }

    #[test]
    fn escalation_never_touches_spam() {
        let spam = ConversationState {
            status: ConversationStatus::Spam,
            assignee: Assignee::Human(None),
        };
        let error = apply(
            &spam,
            &LifecycleEvent::Escalate(EscalationTrigger::HumanReply),
        )
        .expect_err("spam conversations stay spam");
        assert_eq!(error, TransitionError::EscalateUnavailable { status: ConversationStatus::Spam });
    }

    #[test]
    fn auto_close_requires_open_ai_owned() {
        let outcome = apply(&ConversationState::open_ai(), &LifecycleEvent::AutoClose)
            .expect("auto-close");
        assert_eq!(outcome.to.status, ConversationStatus::Closed);
        assert_eq!(outcome.to.assignee, Assignee::Ai);

        let human_owned = ConversationState::open_human(None);
        assert!(apply(&human_owned, &LifecycleEvent::AutoClose).is_err());
    }

    #[test]
    fn ai_cannot_mark_spam() {
        let error = apply(
            &ConversationState::open_ai(),
            &LifecycleEvent::MarkSpam { by_user: None },
        )
        .expect_err("spam requires operator");
        assert_eq!(error, TransitionError::SpamRequiresOperator);

        let by_operator = LifecycleEvent::MarkSpam { by_user: Some(UserId("user_1".to_string())) };
        let outcome = apply(&ConversationState::open_ai(), &by_operator).expect("operator spam");
        assert_eq!(outcome.to.status, ConversationStatus::Spam);
    }

    #[test]
    fn reopen_restores_recovered_assignee() {
        let closed = ConversationState {
            status: ConversationStatus::Closed,
            assignee: Assignee::Human(None),
        };
        let outcome = apply(
            &closed,
            &LifecycleEvent::Reopen { recovered: Some(Assignee::Ai) },
        )
        .expect("reopen");
        assert_eq!(outcome.to, ConversationState::open_ai());
    }

    #[test]
    fn reopen_defaults_to_human_when_unrecoverable() {
        let spam = ConversationState {
            status: ConversationStatus::Spam,
            assignee: Assignee::Ai,
        };
        let outcome = apply(&spam, &LifecycleEvent::Reopen { recovered: None }).expect("reopen");
        assert_eq!(outcome.to.assignee, Assignee::Human(None));
        assert_eq!(outcome.to.status, ConversationStatus::Open);
    }
}
