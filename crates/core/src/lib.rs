pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod similarity;
pub mod text;

pub use chrono;

pub use domain::conversation::{
    Assignee, Conversation, ConversationId, ConversationSlug, ConversationStatus, NewConversation,
    UserId, PLACEHOLDER_SUBJECT,
};
pub use domain::embedding::{embedding_cache_key, EmbeddingCacheEntry};
pub use domain::escalation::{EscalationEvent, EscalationTrigger, NewEscalationEvent};
pub use domain::knowledge::KnowledgeBankEntry;
pub use domain::message::{Message, MessageId, MessageRole, NewMessage};
pub use domain::notification::{MessageNotification, NewMessageNotification};
pub use domain::outbox::{OutboxJob, OutboxJobId, OutboxJobKind, OutboxJobState};
pub use domain::tool::{
    ParameterKind, ParameterValue, RequestMethod, ToolDefinition, ToolInvocationResult,
    ToolParameter,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{ConversationState, LifecycleEvent, TransitionError, TransitionOutcome};
