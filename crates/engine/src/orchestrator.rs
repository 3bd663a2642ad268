//! The response orchestrator: one inbound user message in, one terminal
//! action out - an AI-drafted reply, a transfer to a human, or a
//! human-pending acknowledgment.
//!
//! The agentic loop is strictly sequential for one conversation and bounded
//! by `max_iterations`; different conversations never coordinate. Model
//! transport retries happen inside the provider, never by re-running the
//! loop.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use parley_core::domain::conversation::{Conversation, ConversationStatus};
use parley_core::domain::escalation::EscalationTrigger;
use parley_core::domain::message::{Message, MessageId, MessageRole, NewMessage};
use parley_core::domain::tool::ToolInvocationResult;
use parley_core::lifecycle::{self, ConversationState, LifecycleEvent};
use parley_db::repositories::{
    ConversationRepository, MessageRepository, RepositoryError, ToolRepository,
};

use crate::escalation::{EscalationDetector, EscalationError};
use crate::fanout::{EventFanout, FanoutContext};
use crate::model::{ChatTurn, ModelError, ModelOutcome, ModelProvider, ModelRequest};
use crate::prompts::{CHAT_SYSTEM_PROMPT, FALLBACK_REPLY, HUMAN_PENDING_REPLY};
use crate::retrieval::{RetrievalAssembler, RetrievalError};
use crate::tools::{validate_parameters, ToolExecutor, ToolRegistry, ESCALATION_ACK, ESCALATION_TOOL_SLUG};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Escalation(#[from] EscalationError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] RepositoryError),
}

#[derive(Clone, Debug, Default)]
pub struct TurnContext {
    pub is_new_conversation: bool,
    pub reopened: bool,
    pub is_prompt_originated: bool,
    pub customer_has_unread: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub reply: String,
    pub escalated: bool,
    /// Present only when an `AiAssistant` message was persisted this turn.
    pub message_id: Option<MessageId>,
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub max_iterations: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

pub struct ResponseOrchestrator {
    model: Arc<dyn ModelProvider>,
    retrieval: Arc<RetrievalAssembler>,
    executor: ToolExecutor,
    detector: Arc<EscalationDetector>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    tools: Arc<dyn ToolRepository>,
    fanout: Arc<EventFanout>,
    settings: OrchestratorSettings,
}

impl ResponseOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ModelProvider>,
        retrieval: Arc<RetrievalAssembler>,
        executor: ToolExecutor,
        detector: Arc<EscalationDetector>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        tools: Arc<dyn ToolRepository>,
        fanout: Arc<EventFanout>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            model,
            retrieval,
            executor,
            detector,
            conversations,
            messages,
            tools,
            fanout,
            settings,
        }
    }

    /// Handles one inbound user message. The message must already be
    /// persisted; the orchestrator replays the full history including it.
    pub async fn respond(
        &self,
        conversation: &Conversation,
        user_message: &Message,
        context: &TurnContext,
    ) -> Result<TurnOutcome, OrchestratorError> {
        // A human owns this conversation; the AI stays out of it.
        if !conversation.assignee.is_ai() {
            self.fanout
                .dispatch(conversation, user_message, &self.fanout_context(context, false))
                .await;
            return Ok(TurnOutcome {
                reply: HUMAN_PENDING_REPLY.to_string(),
                escalated: false,
                message_id: None,
            });
        }

        let registry =
            ToolRegistry::from_definitions(self.tools.list_chat_tools().await?);
        let mut turns = self.build_turns(conversation, user_message).await?;
        let schemas = registry.schemas();

        let mut iteration = 0u32;
        let terminal_text = loop {
            if iteration >= self.settings.max_iterations {
                info!(
                    event_name = "engine.orchestrator.iteration_cap",
                    conversation_slug = %conversation.slug.0,
                    max_iterations = self.settings.max_iterations,
                    "tool-call loop hit its cap; using fallback reply"
                );
                break FALLBACK_REPLY.to_string();
            }
            iteration += 1;

            let request = ModelRequest { turns: turns.clone(), tools: schemas.clone() };
            match self.model.complete(&request).await? {
                ModelOutcome::Text(text) => break text,
                ModelOutcome::ToolCall { name, arguments } if name == ESCALATION_TOOL_SLUG => {
                    let reason = arguments
                        .get("reason")
                        .and_then(|value| value.as_str())
                        .map(str::to_string);
                    // Fail closed: if the event cannot be recorded this
                    // propagates and no AI reply is sent this turn.
                    self.detector
                        .escalate(conversation, EscalationTrigger::ExplicitToolCall, reason)
                        .await?;
                    self.fanout
                        .dispatch(conversation, user_message, &self.fanout_context(context, true))
                        .await;
                    return Ok(TurnOutcome {
                        reply: ESCALATION_ACK.to_string(),
                        escalated: true,
                        message_id: None,
                    });
                }
                ModelOutcome::ToolCall { name, arguments } => {
                    let invocation = self.invoke_tool(&registry, &name, &arguments).await;
                    self.persist_tool_turn(conversation, &invocation).await?;
                    turns.push(ChatTurn::ToolCall {
                        name: invocation.tool_slug.clone(),
                        arguments: parameters_json(&invocation),
                    });
                    turns.push(ChatTurn::ToolResult {
                        name: invocation.tool_slug.clone(),
                        result: invocation.raw_result.clone(),
                        success: invocation.success,
                    });
                }
            }
        };

        let assistant_message = self
            .messages
            .insert(NewMessage::text(
                conversation.id,
                MessageRole::AiAssistant,
                terminal_text.clone(),
            ))
            .await?;

        self.auto_close(conversation).await;

        let closed = Conversation {
            status: ConversationStatus::Closed,
            ..conversation.clone()
        };
        self.fanout
            .dispatch(&closed, &assistant_message, &self.fanout_context(context, false))
            .await;

        Ok(TurnOutcome {
            reply: terminal_text,
            escalated: false,
            message_id: Some(assistant_message.id),
        })
    }

    async fn build_turns(
        &self,
        conversation: &Conversation,
        user_message: &Message,
    ) -> Result<Vec<ChatTurn>, OrchestratorError> {
        let system_prompt = CHAT_SYSTEM_PROMPT;
        let query =
            if user_message.cleaned_text.is_empty() { &user_message.body } else { &user_message.cleaned_text };

        let context = match self
            .retrieval
            .assemble(system_prompt, query, Some(&conversation.slug))
            .await
        {
            Ok(assembled) => assembled.context,
            Err(RetrievalError::PromptTooLong) => {
                warn!(
                    event_name = "engine.orchestrator.prompt_too_long",
                    conversation_slug = %conversation.slug.0,
                    "prompt exceeds budget; responding without retrieval context"
                );
                None
            }
        };

        let system = match context {
            Some(context) => format!("{system_prompt}\n\n{context}"),
            None => system_prompt.to_string(),
        };

        let mut turns = vec![ChatTurn::System(system)];
        for message in self.messages.list_for_conversation(&conversation.id).await? {
            match message.role {
                MessageRole::User => turns.push(ChatTurn::User(turn_text(&message))),
                MessageRole::AiAssistant => match &message.tool_invocation {
                    Some(invocation) => turns.push(ChatTurn::ToolCall {
                        name: invocation.tool_slug.clone(),
                        arguments: parameters_json(invocation),
                    }),
                    None => turns.push(ChatTurn::Assistant(turn_text(&message))),
                },
                MessageRole::Staff => turns.push(ChatTurn::Assistant(turn_text(&message))),
                MessageRole::Tool => {
                    if let Some(invocation) = &message.tool_invocation {
                        turns.push(ChatTurn::ToolResult {
                            name: invocation.tool_slug.clone(),
                            result: invocation.raw_result.clone(),
                            success: invocation.success,
                        });
                    }
                }
            }
        }
        Ok(turns)
    }

    async fn invoke_tool(
        &self,
        registry: &ToolRegistry,
        name: &str,
        arguments: &serde_json::Value,
    ) -> ToolInvocationResult {
        let Some(tool) = registry.get(name) else {
            return ToolInvocationResult {
                tool_slug: name.to_string(),
                parameters: Default::default(),
                success: false,
                raw_result: format!("unknown tool `{name}`"),
            };
        };

        match validate_parameters(tool, arguments) {
            // Validation failures never reach the network; they surface to
            // the model as a failed tool-result turn.
            Err(error) => ToolInvocationResult {
                tool_slug: tool.slug.clone(),
                parameters: Default::default(),
                success: false,
                raw_result: error.to_string(),
            },
            Ok(parameters) => {
                // Dispatched calls run to completion on their own task even
                // if the request that started them is aborted; the result
                // is simply discarded with the abandoned turn.
                let executor = self.executor.clone();
                let tool = tool.clone();
                let slug = tool.slug.clone();
                match tokio::spawn(async move { executor.execute(&tool, parameters).await })
                    .await
                {
                    Ok(invocation) => invocation,
                    Err(join_error) => ToolInvocationResult {
                        tool_slug: slug,
                        parameters: Default::default(),
                        success: false,
                        raw_result: format!("tool task failed: {join_error}"),
                    },
                }
            }
        }
    }

    async fn persist_tool_turn(
        &self,
        conversation: &Conversation,
        invocation: &ToolInvocationResult,
    ) -> Result<(), OrchestratorError> {
        // One message pair per call: the assistant's tool-call turn and the
        // tool-result turn, kept in order for replay.
        self.messages
            .insert(NewMessage {
                conversation_id: conversation.id,
                role: MessageRole::AiAssistant,
                body: String::new(),
                cleaned_text: String::new(),
                tool_invocation: Some(invocation.clone()),
            })
            .await?;
        self.messages
            .insert(NewMessage {
                conversation_id: conversation.id,
                role: MessageRole::Tool,
                body: invocation.raw_result.clone(),
                cleaned_text: String::new(),
                tool_invocation: Some(invocation.clone()),
            })
            .await?;
        Ok(())
    }

    async fn auto_close(&self, conversation: &Conversation) {
        let current = ConversationState {
            status: conversation.status,
            assignee: conversation.assignee.clone(),
        };
        match lifecycle::apply(&current, &LifecycleEvent::AutoClose) {
            Ok(outcome) => {
                if let Err(error) = self
                    .conversations
                    .update_state(&conversation.id, outcome.to.status, &outcome.to.assignee)
                    .await
                {
                    warn!(
                        event_name = "engine.orchestrator.auto_close_failed",
                        conversation_slug = %conversation.slug.0,
                        error = %error,
                        "could not auto-close conversation after terminal reply"
                    );
                }
            }
            Err(error) => {
                warn!(
                    event_name = "engine.orchestrator.auto_close_rejected",
                    conversation_slug = %conversation.slug.0,
                    error = %error,
                    "auto-close transition rejected"
                );
            }
        }
    }

    fn fanout_context(&self, context: &TurnContext, escalated: bool) -> FanoutContext {
        FanoutContext {
            is_new_conversation: context.is_new_conversation,
            reopened: context.reopened,
            escalated,
            is_prompt_originated: context.is_prompt_originated,
            customer_has_unread: context.customer_has_unread,
        }
    }
}

fn turn_text(message: &Message) -> String {
    if message.cleaned_text.is_empty() {
        message.body.clone()
    } else {
        message.cleaned_text.clone()
    }
}

fn parameters_json(invocation: &ToolInvocationResult) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = invocation
        .parameters
        .iter()
        .map(|(name, value)| (name.clone(), value.as_json()))
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use parley_core::domain::conversation::{
        Assignee, ConversationStatus, NewConversation, PLACEHOLDER_SUBJECT,
    };
    use parley_core::domain::escalation::EscalationTrigger;
    use parley_core::domain::message::{MessageRole, NewMessage};
    use parley_core::domain::outbox::OutboxJobKind;
    use parley_core::domain::tool::{
        ParameterKind, RequestMethod, ToolDefinition, ToolParameter,
    };
    use parley_db::repositories::{
        ConversationRepository, EscalationEventRepository, InMemoryConversationRepository,
        InMemoryEmbeddingStore, InMemoryEscalationEventRepository,
        InMemoryKnowledgeBankRepository, InMemoryMessageRepository, InMemoryOutboxRepository,
        InMemoryToolRepository, MessageRepository, ToolRepository,
    };

    use super::{
        OrchestratorError, OrchestratorSettings, ResponseOrchestrator, TurnContext,
    };
    use crate::embedding::{EmbeddingError, EmbeddingProvider, EmbeddingService};
    use crate::escalation::EscalationDetector;
    use crate::fanout::EventFanout;
    use crate::model::{ModelError, ModelOutcome, ModelProvider, ModelRequest};
    use crate::prompts::{FALLBACK_REPLY, HUMAN_PENDING_REPLY};
    use crate::retrieval::{RetrievalAssembler, RetrievalSettings};
    use crate::tools::{ToolExecutor, ESCALATION_ACK};

    struct ScriptedModel {
        outcomes: Mutex<VecDeque<ModelOutcome>>,
        repeat: Option<ModelOutcome>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(outcomes: Vec<ModelOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                repeat: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn repeating(outcome: ModelOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::new()),
                repeat: Some(outcome),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelOutcome, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(outcome) = self.outcomes.lock().await.pop_front() {
                return Ok(outcome);
            }
            if let Some(outcome) = &self.repeat {
                return Ok(outcome.clone());
            }
            Err(ModelError::Transport("script exhausted".to_string()))
        }
    }

    struct NullEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for NullEmbeddings {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct Fixture {
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
        events: Arc<InMemoryEscalationEventRepository>,
        tools: Arc<InMemoryToolRepository>,
        outbox: Arc<InMemoryOutboxRepository>,
        orchestrator: ResponseOrchestrator,
    }

    fn fixture(model: Arc<dyn ModelProvider>, settings: OrchestratorSettings) -> Fixture {
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let events = Arc::new(InMemoryEscalationEventRepository::default());
        let tools = Arc::new(InMemoryToolRepository::default());
        let outbox = Arc::new(InMemoryOutboxRepository::default());

        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(NullEmbeddings),
            Arc::new(InMemoryEmbeddingStore::default()),
            30,
        ));
        let retrieval = Arc::new(RetrievalAssembler::new(
            embeddings,
            Arc::new(InMemoryKnowledgeBankRepository::default()),
            conversations.clone(),
            messages.clone(),
            RetrievalSettings::default(),
        ));
        let detector =
            Arc::new(EscalationDetector::new(conversations.clone(), events.clone()));
        let fanout = Arc::new(EventFanout::new(outbox.clone(), messages.clone(), 4, 3));
        let executor = ToolExecutor::new(Duration::from_secs(1)).expect("executor");

        let orchestrator = ResponseOrchestrator::new(
            model,
            retrieval,
            executor,
            detector,
            conversations.clone(),
            messages.clone(),
            tools.clone(),
            fanout,
            settings,
        );

        Fixture { conversations, messages, events, tools, outbox, orchestrator }
    }

    /// A tool whose URL can never be reached; execution records a failed
    /// result without leaving the machine.
    fn unreachable_tool(slug: &str) -> ToolDefinition {
        ToolDefinition {
            slug: slug.to_string(),
            name: "Order lookup".to_string(),
            description: "Look up an order".to_string(),
            parameters: vec![ToolParameter {
                name: "order_id".to_string(),
                kind: ParameterKind::String,
                required: false,
                description: None,
            }],
            request_method: RequestMethod::Get,
            url: "http://127.0.0.1:9/unreachable".to_string(),
            auth_token: None,
            available_in_chat: true,
        }
    }

    async fn seed_turn(
        fixture: &Fixture,
        body: &str,
    ) -> (parley_core::domain::conversation::Conversation, parley_core::domain::message::Message)
    {
        let conversation = fixture
            .conversations
            .create(NewConversation::inbound(Some("ada@example.com".to_string())))
            .await
            .expect("create conversation");
        let message = fixture
            .messages
            .insert(NewMessage::text(conversation.id, MessageRole::User, body))
            .await
            .expect("insert message");
        (conversation, message)
    }

    fn turn_context() -> TurnContext {
        TurnContext {
            is_new_conversation: true,
            reopened: false,
            is_prompt_originated: false,
            customer_has_unread: true,
        }
    }

    #[tokio::test]
    async fn free_text_reply_persists_one_message_and_schedules_subject_regen() {
        let model = ScriptedModel::new(vec![ModelOutcome::Text(
            "Refunds for order #123 are processed within 3 days.".to_string(),
        )]);
        let fixture = fixture(model.clone(), OrchestratorSettings::default());
        let (conversation, message) =
            seed_turn(&fixture, "can I get a refund for order #123").await;
        assert_eq!(conversation.subject, PLACEHOLDER_SUBJECT);

        let outcome = fixture
            .orchestrator
            .respond(&conversation, &message, &turn_context())
            .await
            .expect("respond");

        assert_eq!(model.calls(), 1);
        assert!(!outcome.escalated);
        assert!(outcome.reply.contains("Refunds"));

        let messages = fixture
            .messages
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        let assistant_count = messages
            .iter()
            .filter(|message| message.role == MessageRole::AiAssistant)
            .count();
        assert_eq!(assistant_count, 1);

        // Terminal resolution auto-closes the AI-owned conversation.
        let closed = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert_eq!(closed.assignee, Assignee::Ai);

        let kinds: Vec<_> = fixture.outbox.all().await.iter().map(|job| job.kind).collect();
        assert!(kinds.contains(&OutboxJobKind::RegenerateSubject));
        assert!(kinds.contains(&OutboxJobKind::BroadcastMessage));
    }

    #[tokio::test]
    async fn escalation_tool_call_short_circuits_the_loop() {
        let model = ScriptedModel::new(vec![ModelOutcome::ToolCall {
            name: "request_human_support".to_string(),
            arguments: serde_json::json!({"reason": "explicit request"}),
        }]);
        let fixture = fixture(model.clone(), OrchestratorSettings::default());
        let (conversation, message) = seed_turn(&fixture, "talk to a human").await;

        let outcome = fixture
            .orchestrator
            .respond(&conversation, &message, &turn_context())
            .await
            .expect("respond");

        assert_eq!(model.calls(), 1);
        assert!(outcome.escalated);
        assert_eq!(outcome.reply, ESCALATION_ACK);
        assert_eq!(outcome.message_id, None);

        let escalated = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(escalated.assignee, Assignee::Human(None));
        assert_eq!(escalated.status, ConversationStatus::Open);

        let events = fixture
            .events
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].triggered_by, EscalationTrigger::ExplicitToolCall);
        assert_eq!(events[0].reason.as_deref(), Some("explicit request"));

        // No AI-authored message for the escalated turn.
        let messages = fixture
            .messages
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        assert!(messages.iter().all(|message| message.role != MessageRole::AiAssistant));
    }

    #[tokio::test]
    async fn bounded_loop_hits_the_cap_and_persists_the_fallback() {
        let model = ScriptedModel::repeating(ModelOutcome::ToolCall {
            name: "order_lookup".to_string(),
            arguments: serde_json::json!({"order_id": "A-1"}),
        });
        let fixture = fixture(model.clone(), OrchestratorSettings { max_iterations: 3 });
        fixture.tools.upsert(unreachable_tool("order_lookup")).await.expect("upsert");
        let (conversation, message) = seed_turn(&fixture, "where is my order").await;

        let outcome = fixture
            .orchestrator
            .respond(&conversation, &message, &turn_context())
            .await
            .expect("respond");

        assert_eq!(model.calls(), 3);
        assert_eq!(outcome.reply, FALLBACK_REPLY);

        let messages = fixture
            .messages
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        // Three tool turns, each a call/result pair, plus the user message
        // and the fallback reply.
        let tool_results: Vec<_> = messages
            .iter()
            .filter(|message| message.role == MessageRole::Tool)
            .collect();
        assert_eq!(tool_results.len(), 3);
        assert!(tool_results
            .iter()
            .all(|message| !message.tool_invocation.as_ref().expect("invocation").success));
        assert_eq!(
            messages.last().map(|message| message.body.as_str()),
            Some(FALLBACK_REPLY)
        );
    }

    #[tokio::test]
    async fn invalid_tool_parameters_are_rejected_without_http_then_surfaced() {
        let model = ScriptedModel::new(vec![
            ModelOutcome::ToolCall {
                name: "refund_check".to_string(),
                arguments: serde_json::json!({"amount": "abc"}),
            },
            ModelOutcome::Text("I couldn't verify the amount.".to_string()),
        ]);
        let fixture = fixture(model.clone(), OrchestratorSettings::default());
        fixture
            .tools
            .upsert(ToolDefinition {
                parameters: vec![ToolParameter {
                    name: "amount".to_string(),
                    kind: ParameterKind::Number,
                    required: true,
                    description: None,
                }],
                ..unreachable_tool("refund_check")
            })
            .await
            .expect("upsert");
        let (conversation, message) = seed_turn(&fixture, "refund 12 please").await;

        let outcome = fixture
            .orchestrator
            .respond(&conversation, &message, &turn_context())
            .await
            .expect("respond");

        assert_eq!(model.calls(), 2);
        assert!(outcome.reply.contains("couldn't verify"));

        let messages = fixture
            .messages
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        let tool_message = messages
            .iter()
            .find(|message| message.role == MessageRole::Tool)
            .expect("tool turn persisted");
        let invocation = tool_message.tool_invocation.as_ref().expect("invocation");
        assert!(!invocation.success);
        assert!(invocation.raw_result.contains("not a valid number"));
    }

    #[tokio::test]
    async fn escalation_persistence_failure_fails_closed() {
        let model = ScriptedModel::new(vec![ModelOutcome::ToolCall {
            name: "request_human_support".to_string(),
            arguments: serde_json::json!({"reason": "angry customer"}),
        }]);
        let fixture = fixture(model.clone(), OrchestratorSettings::default());
        let (conversation, message) = seed_turn(&fixture, "this is useless").await;
        fixture.events.fail_appends();

        let result = fixture
            .orchestrator
            .respond(&conversation, &message, &turn_context())
            .await;
        assert!(matches!(result, Err(OrchestratorError::Escalation(_))));

        // Fail closed: no AI message, conversation still open and AI-owned.
        let unchanged = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(unchanged.status, ConversationStatus::Open);
        assert_eq!(unchanged.assignee, Assignee::Ai);
        let messages = fixture
            .messages
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        assert!(messages.iter().all(|message| message.role != MessageRole::AiAssistant));
    }

    #[tokio::test]
    async fn human_owned_conversation_gets_the_pending_reply_without_a_model_call() {
        let model = ScriptedModel::new(Vec::new());
        let fixture = fixture(model.clone(), OrchestratorSettings::default());
        let (conversation, message) = seed_turn(&fixture, "any update?").await;
        fixture
            .conversations
            .update_state(&conversation.id, ConversationStatus::Open, &Assignee::Human(None))
            .await
            .expect("hand off");
        let human_owned = fixture
            .conversations
            .find_by_id(&conversation.id)
            .await
            .expect("find")
            .expect("present");

        let outcome = fixture
            .orchestrator
            .respond(&human_owned, &message, &turn_context())
            .await
            .expect("respond");

        assert_eq!(model.calls(), 0);
        assert_eq!(outcome.reply, HUMAN_PENDING_REPLY);
        assert_eq!(outcome.message_id, None);
    }

    #[tokio::test]
    async fn tool_turn_history_replays_into_subsequent_requests() {
        let model = ScriptedModel::new(vec![
            ModelOutcome::ToolCall {
                name: "order_lookup".to_string(),
                arguments: serde_json::json!({"order_id": "A-1"}),
            },
            ModelOutcome::Text("Your order is on its way.".to_string()),
        ]);
        let fixture = fixture(model.clone(), OrchestratorSettings::default());
        fixture.tools.upsert(unreachable_tool("order_lookup")).await.expect("upsert");
        let (conversation, message) = seed_turn(&fixture, "where is order A-1").await;

        fixture
            .orchestrator
            .respond(&conversation, &message, &turn_context())
            .await
            .expect("respond");

        let messages = fixture
            .messages
            .list_for_conversation(&conversation.id)
            .await
            .expect("list");
        let roles: Vec<_> = messages.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::AiAssistant, // tool-call turn
                MessageRole::Tool,        // tool-result turn
                MessageRole::AiAssistant, // terminal reply
            ]
        );
    }
}
