use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationId;
use crate::domain::message::MessageId;

/// Customer-facing notification about a reply they have not read yet.
/// At most one per message; redelivery is a no-op.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotification {
    pub id: i64,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub customer_email: String,
    pub notification_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessageNotification {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub customer_email: String,
    pub notification_text: String,
}
