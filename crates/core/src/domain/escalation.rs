use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    ExplicitToolCall,
    HumanReply,
    BadFlag,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitToolCall => "explicit_tool_call",
            Self::HumanReply => "human_reply",
            Self::BadFlag => "bad_flag",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "explicit_tool_call" => Some(Self::ExplicitToolCall),
            "human_reply" => Some(Self::HumanReply),
            "bad_flag" => Some(Self::BadFlag),
            _ => None,
        }
    }
}

/// Append-only record of an ownership transfer to a human operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub reason: Option<String>,
    pub triggered_by: EscalationTrigger,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewEscalationEvent {
    pub conversation_id: ConversationId,
    pub reason: Option<String>,
    pub triggered_by: EscalationTrigger,
}
