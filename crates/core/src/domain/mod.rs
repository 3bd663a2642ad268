pub mod conversation;
pub mod embedding;
pub mod escalation;
pub mod knowledge;
pub mod message;
pub mod notification;
pub mod outbox;
pub mod tool;
