use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::message::MessageId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxJobId(pub String);

impl OutboxJobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Side effects fanned out after a terminal message. One job per
/// (message, kind); redelivery of the same event is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxJobKind {
    BroadcastMessage,
    BroadcastConversationList,
    RegenerateSubject,
    RegenerateSummary,
    CreateNotification,
}

impl OutboxJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BroadcastMessage => "broadcast_message",
            Self::BroadcastConversationList => "broadcast_conversation_list",
            Self::RegenerateSubject => "regenerate_subject",
            Self::RegenerateSummary => "regenerate_summary",
            Self::CreateNotification => "create_notification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "broadcast_message" => Some(Self::BroadcastMessage),
            "broadcast_conversation_list" => Some(Self::BroadcastConversationList),
            "regenerate_subject" => Some(Self::RegenerateSubject),
            "regenerate_summary" => Some(Self::RegenerateSummary),
            "create_notification" => Some(Self::CreateNotification),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxJobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl OutboxJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxJob {
    pub id: OutboxJobId,
    pub message_id: MessageId,
    pub kind: OutboxJobKind,
    pub payload_json: String,
    pub state: OutboxJobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxJob {
    pub fn enqueue(
        message_id: MessageId,
        kind: OutboxJobKind,
        payload_json: String,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OutboxJobId::generate(),
            message_id,
            kind,
            payload_json,
            state: OutboxJobState::Queued,
            attempts: 0,
            max_attempts,
            available_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OutboxJob, OutboxJobKind, OutboxJobState};
    use crate::domain::message::MessageId;

    #[test]
    fn kind_round_trips_from_storage_encoding() {
        for kind in [
            OutboxJobKind::BroadcastMessage,
            OutboxJobKind::BroadcastConversationList,
            OutboxJobKind::RegenerateSubject,
            OutboxJobKind::RegenerateSummary,
            OutboxJobKind::CreateNotification,
        ] {
            assert_eq!(OutboxJobKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn state_round_trips_from_storage_encoding() {
        for state in [
            OutboxJobState::Queued,
            OutboxJobState::Running,
            OutboxJobState::Completed,
            OutboxJobState::Failed,
        ] {
            assert_eq!(OutboxJobState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn enqueued_jobs_start_queued_and_immediately_available() {
        let job = OutboxJob::enqueue(
            MessageId(7),
            OutboxJobKind::RegenerateSubject,
            "{}".to_string(),
            3,
        );
        assert_eq!(job.state, OutboxJobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.available_at <= chrono::Utc::now());
    }
}
