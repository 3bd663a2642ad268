use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationId;
use crate::domain::tool::ToolInvocationResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    AiAssistant,
    Staff,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::AiAssistant => "ai_assistant",
            Self::Staff => "staff",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "ai_assistant" => Some(Self::AiAssistant),
            "staff" => Some(Self::Staff),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Immutable once persisted except for the moderation flag pair.
///
/// A `Tool` message always carries exactly one [`ToolInvocationResult`]; the
/// `AiAssistant` message that requested the call carries the same invocation
/// so prior turns replay without lookahead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub body: String,
    pub cleaned_text: String,
    pub tool_invocation: Option<ToolInvocationResult>,
    pub is_flagged_as_bad: bool,
    pub flag_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub body: String,
    pub cleaned_text: String,
    pub tool_invocation: Option<ToolInvocationResult>,
}

impl NewMessage {
    pub fn text(conversation_id: ConversationId, role: MessageRole, body: impl Into<String>) -> Self {
        let body = body.into();
        let cleaned_text = crate::text::clean_for_model(&body);
        Self { conversation_id, role, body, cleaned_text, tool_invocation: None }
    }
}
