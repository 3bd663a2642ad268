//! Message intake surface.
//!
//! The widget submits messages and receives conversation-slug
//! acknowledgements; everything else it learns over the realtime channel.
//! Customers only ever see a drafted reply, an escalation acknowledgment,
//! or a generic retry message - internal errors never leak.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use parley_core::domain::conversation::{
    Conversation, ConversationSlug, ConversationStatus, NewConversation,
};
use parley_core::domain::escalation::EscalationTrigger;
use parley_core::domain::message::{MessageId, MessageRole, NewMessage};
use parley_core::errors::{ApplicationError, InterfaceError};
use parley_core::lifecycle::{self, ConversationState, LifecycleEvent};
use parley_db::repositories::{ConversationRepository, MessageRepository};
use parley_engine::escalation::{EscalationDetector, EscalationError};
use parley_engine::orchestrator::{OrchestratorError, ResponseOrchestrator, TurnContext};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ResponseOrchestrator>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub detector: Arc<EscalationDetector>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/message", post(post_message))
        .route("/api/conversations/{slug}/staff-replies", post(post_staff_reply))
        .route("/api/messages/{id}/flag", post(flag_message))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub conversation_slug: Option<String>,
    pub content: String,
    pub customer_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageResponse {
    pub conversation_slug: String,
    pub reply: String,
    pub escalated: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub correlation_id: String,
}

async fn post_message(
    State(state): State<AppState>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<ChatMessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let correlation_id = Uuid::new_v4().to_string();

    if request.content.trim().is_empty() {
        return Err(bad_request("message content must not be empty", &correlation_id));
    }

    let (mut conversation, is_new) = resolve_conversation(&state, &request, &correlation_id).await?;

    // Spam takes no action at all; the submitter still gets the slug back.
    if conversation.status == ConversationStatus::Spam {
        return Ok(Json(ChatMessageResponse {
            conversation_slug: conversation.slug.0,
            reply: String::new(),
            escalated: false,
        }));
    }

    let mut reopened = false;
    if conversation.status == ConversationStatus::Closed {
        conversation = reopen(&state, conversation, &correlation_id).await?;
        reopened = true;
    }

    let user_message = state
        .messages
        .insert(NewMessage::text(conversation.id, MessageRole::User, request.content.clone()))
        .await
        .map_err(|e| persistence_error(e.to_string(), &correlation_id))?;

    info!(
        event_name = "server.chat.message_received",
        correlation_id = %correlation_id,
        conversation_slug = %conversation.slug.0,
        is_new_conversation = is_new,
        reopened,
        "inbound chat message accepted"
    );

    let context = TurnContext {
        is_new_conversation: is_new,
        reopened,
        is_prompt_originated: false,
        customer_has_unread: true,
    };
    match state.orchestrator.respond(&conversation, &user_message, &context).await {
        Ok(outcome) => Ok(Json(ChatMessageResponse {
            conversation_slug: conversation.slug.0,
            reply: outcome.reply,
            escalated: outcome.escalated,
        })),
        Err(error) => Err(orchestrator_error(error, &correlation_id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct StaffReplyRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct StaffReplyResponse {
    pub message_id: i64,
}

/// A staff member replying in-thread takes the conversation over from the
/// AI.
async fn post_staff_reply(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<StaffReplyRequest>,
) -> Result<Json<StaffReplyResponse>, (StatusCode, Json<ErrorResponse>)> {
    let correlation_id = Uuid::new_v4().to_string();

    if request.content.trim().is_empty() {
        return Err(bad_request("reply content must not be empty", &correlation_id));
    }

    let conversation = state
        .conversations
        .find_by_slug(&ConversationSlug(slug))
        .await
        .map_err(|e| persistence_error(e.to_string(), &correlation_id))?
        .ok_or_else(|| not_found("unknown conversation", &correlation_id))?;

    // Escalate before the reply lands so a persistence failure in the
    // event log blocks the takeover rather than dropping the signal.
    match state
        .detector
        .escalate(&conversation, EscalationTrigger::HumanReply, None)
        .await
    {
        Ok(_) => {}
        Err(EscalationError::Transition(error)) => {
            return Err(bad_request(&error.to_string(), &correlation_id));
        }
        Err(error) => return Err(escalation_error(error, &correlation_id)),
    }

    let message = state
        .messages
        .insert(NewMessage::text(conversation.id, MessageRole::Staff, request.content))
        .await
        .map_err(|e| persistence_error(e.to_string(), &correlation_id))?;

    info!(
        event_name = "server.chat.staff_reply",
        correlation_id = %correlation_id,
        conversation_slug = %conversation.slug.0,
        "staff reply recorded"
    );

    Ok(Json(StaffReplyResponse { message_id: message.id.0 }))
}

#[derive(Debug, Deserialize)]
pub struct FlagMessageRequest {
    pub reason: Option<String>,
}

/// Flags an AI reply as bad, which escalates the conversation to a human
/// immediately.
async fn flag_message(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Json(request): Json<FlagMessageRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let correlation_id = Uuid::new_v4().to_string();
    let message_id = MessageId(message_id);

    let message = state
        .messages
        .find_by_id(&message_id)
        .await
        .map_err(|e| persistence_error(e.to_string(), &correlation_id))?
        .ok_or_else(|| not_found("message not found", &correlation_id))?;

    if message.role != MessageRole::AiAssistant {
        return Err(bad_request("only AI responses can be flagged", &correlation_id));
    }

    state
        .messages
        .set_flagged(&message_id, request.reason.as_deref())
        .await
        .map_err(|e| persistence_error(e.to_string(), &correlation_id))?;

    let conversation = state
        .conversations
        .find_by_id(&message.conversation_id)
        .await
        .map_err(|e| persistence_error(e.to_string(), &correlation_id))?
        .ok_or_else(|| not_found("conversation not found", &correlation_id))?;

    match state
        .detector
        .escalate(&conversation, EscalationTrigger::BadFlag, request.reason.clone())
        .await
    {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(EscalationError::Transition(_)) => {
            // Spam conversations cannot be escalated; the flag itself stuck.
            Ok(StatusCode::NO_CONTENT)
        }
        Err(error) => Err(escalation_error(error, &correlation_id)),
    }
}

async fn resolve_conversation(
    state: &AppState,
    request: &ChatMessageRequest,
    correlation_id: &str,
) -> Result<(Conversation, bool), (StatusCode, Json<ErrorResponse>)> {
    match &request.conversation_slug {
        Some(slug) => {
            let conversation = state
                .conversations
                .find_by_slug(&ConversationSlug(slug.clone()))
                .await
                .map_err(|e| persistence_error(e.to_string(), correlation_id))?
                .ok_or_else(|| not_found("unknown conversation", correlation_id))?;
            Ok((conversation, false))
        }
        None => {
            let conversation = state
                .conversations
                .create(NewConversation::inbound(request.customer_email.clone()))
                .await
                .map_err(|e| persistence_error(e.to_string(), correlation_id))?;
            Ok((conversation, true))
        }
    }
}

async fn reopen(
    state: &AppState,
    conversation: Conversation,
    correlation_id: &str,
) -> Result<Conversation, (StatusCode, Json<ErrorResponse>)> {
    let current = ConversationState {
        status: conversation.status,
        assignee: conversation.assignee.clone(),
    };
    let outcome = lifecycle::apply(
        &current,
        &LifecycleEvent::Reopen { recovered: Some(conversation.assignee.clone()) },
    )
    .map_err(|e| bad_request(&e.to_string(), correlation_id))?;

    state
        .conversations
        .update_state(&conversation.id, outcome.to.status, &outcome.to.assignee)
        .await
        .map_err(|e| persistence_error(e.to_string(), correlation_id))?;

    Ok(Conversation {
        status: outcome.to.status,
        assignee: outcome.to.assignee,
        closed_at: None,
        ..conversation
    })
}

fn orchestrator_error(
    error: OrchestratorError,
    correlation_id: &str,
) -> (StatusCode, Json<ErrorResponse>) {
    error!(
        event_name = "server.chat.turn_failed",
        correlation_id = %correlation_id,
        error = %error,
        "orchestrator turn failed"
    );
    let application_error = match error {
        OrchestratorError::Escalation(inner) => {
            ApplicationError::EscalationPersistence(inner.to_string())
        }
        OrchestratorError::Model(inner) => ApplicationError::ModelProvider(inner.to_string()),
        OrchestratorError::Persistence(inner) => ApplicationError::Persistence(inner.to_string()),
    };
    interface_response(application_error.into_interface(correlation_id))
}

fn escalation_error(
    error: EscalationError,
    correlation_id: &str,
) -> (StatusCode, Json<ErrorResponse>) {
    error!(
        event_name = "server.chat.flag_escalation_failed",
        correlation_id = %correlation_id,
        error = %error,
        "bad-flag escalation failed"
    );
    interface_response(
        ApplicationError::EscalationPersistence(error.to_string()).into_interface(correlation_id),
    )
}

fn persistence_error(detail: String, correlation_id: &str) -> (StatusCode, Json<ErrorResponse>) {
    error!(
        event_name = "server.chat.persistence_failed",
        correlation_id = %correlation_id,
        error = %detail,
        "persistence failure"
    );
    interface_response(ApplicationError::Persistence(detail).into_interface(correlation_id))
}

fn bad_request(message: &str, correlation_id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            correlation_id: correlation_id.to_string(),
        }),
    )
}

fn not_found(message: &str, correlation_id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
            correlation_id: correlation_id.to_string(),
        }),
    )
}

fn interface_response(error: InterfaceError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let correlation_id = match &error {
        InterfaceError::BadRequest { correlation_id, .. }
        | InterfaceError::ServiceUnavailable { correlation_id, .. }
        | InterfaceError::Internal { correlation_id, .. } => correlation_id.clone(),
    };
    (
        status,
        Json(ErrorResponse { error: error.user_message().to_string(), correlation_id }),
    )
}
