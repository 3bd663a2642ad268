//! Real-time broadcast contract.
//!
//! The core only publishes: a named channel derived from the conversation
//! identity, an event name, and a JSON payload. The widget and dashboard
//! consumers live outside this crate.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use parley_core::domain::conversation::ConversationSlug;

pub const CONVERSATION_LIST_CHANNEL: &str = "conversations";

pub fn conversation_channel(slug: &ConversationSlug) -> String {
    format!("conversation/{}", slug.0)
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broadcast failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), PublishError>;
}

/// Default publisher when no realtime backend is wired up: the publish
/// contract is logged and consumers attach elsewhere.
#[derive(Default)]
pub struct TracingPublisher;

#[async_trait]
impl RealtimePublisher for TracingPublisher {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), PublishError> {
        info!(
            event_name = "engine.realtime.publish",
            channel,
            broadcast_event = event,
            payload = %payload,
            "realtime broadcast"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedEvent {
    pub channel: String,
    pub event: String,
    pub payload: String,
}

/// Captures broadcasts for assertions.
#[derive(Default)]
pub struct InMemoryPublisher {
    events: Mutex<Vec<PublishedEvent>>,
}

impl InMemoryPublisher {
    pub async fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl RealtimePublisher for InMemoryPublisher {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), PublishError> {
        self.events.lock().await.push(PublishedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
