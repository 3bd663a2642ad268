use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub i64);

/// Opaque public identity handed to the widget; the numeric id never leaves
/// the core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationSlug(pub String);

impl ConversationSlug {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
    Spam,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Spam => "spam",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "spam" => Some(Self::Spam),
            _ => None,
        }
    }
}

/// Conversation ownership. AI-owned and human-owned are mutually exclusive
/// by construction; a human-owned conversation may still be waiting for a
/// specific operator to pick it up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assignee {
    Ai,
    Human(Option<UserId>),
}

impl Assignee {
    pub fn is_ai(&self) -> bool {
        matches!(self, Self::Ai)
    }

    /// Storage encoding as the (assigned_to_ai, assigned_to_user_id) column
    /// pair.
    pub fn to_columns(&self) -> (bool, Option<&str>) {
        match self {
            Self::Ai => (true, None),
            Self::Human(user) => (false, user.as_ref().map(|id| id.0.as_str())),
        }
    }

    /// Decodes the column pair. An AI-assigned row with a user id is an
    /// illegal combination and refused.
    pub fn from_columns(assigned_to_ai: bool, user_id: Option<String>) -> Option<Self> {
        match (assigned_to_ai, user_id) {
            (true, None) => Some(Self::Ai),
            (true, Some(_)) => None,
            (false, user) => Some(Self::Human(user.map(UserId))),
        }
    }
}

pub const PLACEHOLDER_SUBJECT: &str = "(no subject)";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub slug: ConversationSlug,
    pub status: ConversationStatus,
    pub assignee: Assignee,
    pub subject: String,
    pub summary: Option<Vec<String>>,
    pub embedding: Option<Vec<f32>>,
    pub customer_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Insert form; the id is assigned by storage.
#[derive(Clone, Debug, PartialEq)]
pub struct NewConversation {
    pub slug: ConversationSlug,
    pub status: ConversationStatus,
    pub assignee: Assignee,
    pub subject: String,
    pub customer_email: Option<String>,
}

impl NewConversation {
    /// A brand-new conversation created by the first inbound customer
    /// message: open, AI-owned, placeholder subject.
    pub fn inbound(customer_email: Option<String>) -> Self {
        Self {
            slug: ConversationSlug::generate(),
            status: ConversationStatus::Open,
            assignee: Assignee::Ai,
            subject: PLACEHOLDER_SUBJECT.to_string(),
            customer_email,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Assignee, ConversationSlug, ConversationStatus, NewConversation, UserId};

    #[test]
    fn status_round_trips_from_storage_encoding() {
        for status in [
            ConversationStatus::Open,
            ConversationStatus::Closed,
            ConversationStatus::Spam,
        ] {
            assert_eq!(ConversationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConversationStatus::parse("merged"), None);
    }

    #[test]
    fn assignee_column_encoding_round_trips() {
        let cases = [
            Assignee::Ai,
            Assignee::Human(None),
            Assignee::Human(Some(UserId("user_1".to_string()))),
        ];
        for assignee in cases {
            let (ai, user) = assignee.to_columns();
            let decoded = Assignee::from_columns(ai, user.map(str::to_string));
            assert_eq!(decoded, Some(assignee));
        }
    }

    #[test]
    fn ai_assignment_with_user_id_is_unrepresentable() {
        assert_eq!(Assignee::from_columns(true, Some("user_1".to_string())), None);
    }

    #[test]
    fn inbound_conversation_starts_open_and_ai_owned() {
        let conversation = NewConversation::inbound(Some("ada@example.com".to_string()));
        assert_eq!(conversation.status, ConversationStatus::Open);
        assert_eq!(conversation.assignee, Assignee::Ai);
        assert_eq!(conversation.subject, super::PLACEHOLDER_SUBJECT);
        assert!(!conversation.slug.0.is_empty());
    }

    #[test]
    fn generated_slugs_are_unique() {
        assert_ne!(ConversationSlug::generate(), ConversationSlug::generate());
    }
}
