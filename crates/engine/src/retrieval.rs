//! Retrieval-augmented context assembly.
//!
//! Combines knowledge-bank lookup and past-conversation similarity search
//! into one structured prompt section. Both lookups run concurrently and
//! each degrades to an empty section on failure; only a prompt that cannot
//! fit even its floor (system prompt + query) is an error, and a
//! recoverable one.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use parley_core::domain::conversation::ConversationSlug;

use crate::embedding::EmbeddingService;
use crate::prompts::{
    section, KNOWLEDGE_BANK_HEADER, PAST_CONVERSATIONS_HEADER, STYLE_EXAMPLES_HEADER,
};
use parley_db::repositories::{ConversationRepository, KnowledgeBankRepository, MessageRepository};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("prompt exceeds the context budget even without retrieval context")]
    PromptTooLong,
}

#[derive(Clone, Debug, Default)]
pub struct StyleExample {
    pub before: String,
    pub after: String,
}

#[derive(Clone, Debug)]
pub struct RetrievalSettings {
    pub similarity_threshold: f32,
    pub max_knowledge_entries: usize,
    pub max_past_conversations: usize,
    pub context_char_budget: usize,
    pub style_examples: Vec<StyleExample>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            max_knowledge_entries: 5,
            max_past_conversations: 5,
            context_char_budget: 24_000,
            style_examples: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SectionKind {
    KnowledgeBank,
    PastConversation,
}

#[derive(Clone, Debug)]
struct RetrievedItem {
    kind: SectionKind,
    body: String,
    similarity: f32,
}

/// The assembled prompt context. `context` is `None` when nothing cleared
/// the threshold; the section simply does not appear in the prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct AssembledContext {
    pub context: Option<String>,
}

pub struct RetrievalAssembler {
    embeddings: Arc<EmbeddingService>,
    knowledge: Arc<dyn KnowledgeBankRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    settings: RetrievalSettings,
}

impl RetrievalAssembler {
    pub fn new(
        embeddings: Arc<EmbeddingService>,
        knowledge: Arc<dyn KnowledgeBankRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        settings: RetrievalSettings,
    ) -> Self {
        Self { embeddings, knowledge, conversations, messages, settings }
    }

    /// Assembles the retrieval context for `query`, bounded so that
    /// system prompt + context + query fits the character budget. Lowest
    /// similarity items are dropped first; the query is never truncated.
    pub async fn assemble(
        &self,
        system_prompt: &str,
        query: &str,
        exclude: Option<&ConversationSlug>,
    ) -> Result<AssembledContext, RetrievalError> {
        let floor = system_prompt.len() + query.len();
        if floor > self.settings.context_char_budget {
            return Err(RetrievalError::PromptTooLong);
        }

        let query_embedding = match self.embeddings.embed(query, false).await {
            Ok(embedding) => embedding,
            Err(error) => {
                warn!(
                    event_name = "engine.retrieval.embedding_failed",
                    error = %error,
                    "query embedding failed; responding without retrieval context"
                );
                return Ok(AssembledContext { context: self.render(Vec::new(), floor) });
            }
        };

        // Independent lookups; neither depends on the other's result.
        let (knowledge_matches, past_matches) = tokio::join!(
            self.knowledge.find_similar_enabled(
                &query_embedding,
                self.settings.similarity_threshold,
                self.settings.max_knowledge_entries,
            ),
            self.conversations.find_similar_closed(
                &query_embedding,
                self.settings.similarity_threshold,
                self.settings.max_past_conversations,
                exclude,
            ),
        );

        let mut items = Vec::new();

        match knowledge_matches {
            Ok(matches) => {
                for (entry, similarity) in matches {
                    items.push(RetrievedItem {
                        kind: SectionKind::KnowledgeBank,
                        body: entry.content,
                        similarity,
                    });
                }
            }
            Err(error) => {
                warn!(
                    event_name = "engine.retrieval.knowledge_lookup_failed",
                    error = %error,
                    "knowledge bank lookup failed; omitting section"
                );
            }
        }

        match past_matches {
            Ok(matches) => {
                for (conversation, similarity) in matches {
                    match self.messages.first_user_message(&conversation.id).await {
                        Ok(Some(message)) => items.push(RetrievedItem {
                            kind: SectionKind::PastConversation,
                            body: message.cleaned_text,
                            similarity,
                        }),
                        Ok(None) => {}
                        Err(error) => {
                            warn!(
                                event_name = "engine.retrieval.past_message_fetch_failed",
                                error = %error,
                                conversation_slug = %conversation.slug.0,
                                "could not fetch representative message; skipping match"
                            );
                        }
                    }
                }
            }
            Err(error) => {
                warn!(
                    event_name = "engine.retrieval.past_lookup_failed",
                    error = %error,
                    "past conversation lookup failed; omitting section"
                );
            }
        }

        Ok(AssembledContext { context: self.render(items, floor) })
    }

    fn render(&self, mut items: Vec<RetrievedItem>, floor: usize) -> Option<String> {
        let budget = self.settings.context_char_budget - floor;

        loop {
            let rendered = self.render_sections(&items);
            match rendered {
                None => return None,
                Some(text) if text.len() <= budget => return Some(text),
                Some(_) => {
                    // Over budget: drop the weakest match and re-render.
                    let (weakest_index, _) = items.iter().enumerate().min_by(|a, b| {
                        a.1.similarity
                            .partial_cmp(&b.1.similarity)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })?;
                    items.remove(weakest_index);
                }
            }
        }
    }

    fn render_sections(&self, items: &[RetrievedItem]) -> Option<String> {
        let knowledge: Vec<String> = items
            .iter()
            .filter(|item| item.kind == SectionKind::KnowledgeBank)
            .map(|item| item.body.clone())
            .collect();
        let past: Vec<String> = items
            .iter()
            .filter(|item| item.kind == SectionKind::PastConversation)
            .map(|item| item.body.clone())
            .collect();

        let mut sections = Vec::new();
        if !knowledge.is_empty() {
            sections.push(section(KNOWLEDGE_BANK_HEADER, &knowledge));
        }
        if !past.is_empty() {
            sections.push(section(PAST_CONVERSATIONS_HEADER, &past));
        }
        if !sections.is_empty() && !self.settings.style_examples.is_empty() {
            let examples: Vec<String> = self
                .settings
                .style_examples
                .iter()
                .map(|example| format!("Before: {}\nAfter: {}", example.before, example.after))
                .collect();
            sections.push(section(STYLE_EXAMPLES_HEADER, &examples));
        }

        (!sections.is_empty()).then(|| sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parley_core::domain::conversation::{Assignee, ConversationStatus, NewConversation};
    use parley_core::domain::knowledge::KnowledgeBankEntry;
    use parley_core::domain::message::{MessageRole, NewMessage};
    use parley_db::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryEmbeddingStore,
        InMemoryKnowledgeBankRepository, InMemoryMessageRepository, KnowledgeBankRepository,
        MessageRepository,
    };

    use super::{RetrievalAssembler, RetrievalError, RetrievalSettings, StyleExample};
    use crate::embedding::{EmbeddingError, EmbeddingProvider, EmbeddingService};

    struct FixedProvider {
        vector: Vec<f32>,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.fail {
                return Err(EmbeddingError::Transport("provider down".to_string()));
            }
            Ok(self.vector.clone())
        }
    }

    struct Fixture {
        knowledge: Arc<InMemoryKnowledgeBankRepository>,
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
    }

    fn assembler(
        settings: RetrievalSettings,
        provider_fail: bool,
    ) -> (RetrievalAssembler, Fixture) {
        let provider = Arc::new(FixedProvider { vector: vec![1.0, 0.0], fail: provider_fail });
        let embeddings = Arc::new(EmbeddingService::new(
            provider,
            Arc::new(InMemoryEmbeddingStore::default()),
            30,
        ));
        let fixture = Fixture {
            knowledge: Arc::new(InMemoryKnowledgeBankRepository::default()),
            conversations: Arc::new(InMemoryConversationRepository::default()),
            messages: Arc::new(InMemoryMessageRepository::default()),
        };
        let assembler = RetrievalAssembler::new(
            embeddings,
            fixture.knowledge.clone(),
            fixture.conversations.clone(),
            fixture.messages.clone(),
            settings,
        );
        (assembler, fixture)
    }

    fn entry(content: &str, embedding: Vec<f32>) -> KnowledgeBankEntry {
        KnowledgeBankEntry { id: 0, content: content.to_string(), embedding, enabled: true }
    }

    #[tokio::test]
    async fn threshold_filtering_keeps_exactly_the_close_matches() {
        let (assembler, fixture) = assembler(RetrievalSettings::default(), false);

        // Similarities against [1, 0]: 0.9, 0.65, 0.4.
        fixture.knowledge.insert(entry("nine", vec![0.9, 0.436])).await.expect("insert");
        fixture.knowledge.insert(entry("sixtyfive", vec![0.65, 0.76])).await.expect("insert");
        fixture.knowledge.insert(entry("forty", vec![0.4, 0.917])).await.expect("insert");

        let assembled = assembler
            .assemble("system", "can I get a refund", None)
            .await
            .expect("assemble");
        let context = assembled.context.expect("context present");

        assert!(context.starts_with("Knowledge bank\n"));
        assert!(context.contains("nine"));
        assert!(context.contains("sixtyfive"));
        assert!(!context.contains("forty"));
        // Descending by similarity.
        assert!(context.find("nine").unwrap() < context.find("sixtyfive").unwrap());
    }

    #[tokio::test]
    async fn empty_sections_are_omitted_entirely() {
        let (assembler, _fixture) = assembler(RetrievalSettings::default(), false);

        let assembled = assembler
            .assemble("system", "completely novel question", None)
            .await
            .expect("assemble");
        assert_eq!(assembled.context, None);
    }

    #[tokio::test]
    async fn past_conversations_use_the_first_user_message() {
        let (assembler, fixture) = assembler(RetrievalSettings::default(), false);

        let past = fixture
            .conversations
            .create(NewConversation::inbound(None))
            .await
            .expect("create");
        fixture
            .messages
            .insert(NewMessage::text(past.id, MessageRole::User, "my refund never arrived"))
            .await
            .expect("insert");
        fixture
            .messages
            .insert(NewMessage::text(past.id, MessageRole::AiAssistant, "resolved it"))
            .await
            .expect("insert");
        fixture
            .conversations
            .update_embedding(&past.id, &[1.0, 0.0])
            .await
            .expect("embed");
        fixture
            .conversations
            .update_state(&past.id, ConversationStatus::Closed, &Assignee::Ai)
            .await
            .expect("close");

        let assembled = assembler
            .assemble("system", "refund status", None)
            .await
            .expect("assemble");
        let context = assembled.context.expect("context");
        assert!(context.contains("Past conversations"));
        assert!(context.contains("my refund never arrived"));
        assert!(!context.contains("resolved it"));
    }

    #[tokio::test]
    async fn style_examples_render_after_retrieved_sections() {
        let settings = RetrievalSettings {
            style_examples: vec![StyleExample {
                before: "We cannot do that.".to_string(),
                after: "Happy to help find another way!".to_string(),
            }],
            ..RetrievalSettings::default()
        };
        let (assembler, fixture) = assembler(settings, false);
        fixture.knowledge.insert(entry("refunds take 3 days", vec![1.0, 0.0])).await.expect("insert");

        let context = assembler
            .assemble("system", "refund", None)
            .await
            .expect("assemble")
            .context
            .expect("context");
        assert!(context.contains("Style examples"));
        assert!(context.find("Knowledge bank").unwrap() < context.find("Style examples").unwrap());
    }

    #[tokio::test]
    async fn budget_overflow_drops_lowest_similarity_first() {
        let settings = RetrievalSettings {
            // Floor is len("system") + len("refund") = 12; leave room for
            // roughly one entry.
            context_char_budget: 12 + 60,
            ..RetrievalSettings::default()
        };
        let (assembler, fixture) = assembler(settings, false);

        fixture
            .knowledge
            .insert(entry("closest entry kept under pressure", vec![1.0, 0.0]))
            .await
            .expect("insert");
        fixture
            .knowledge
            .insert(entry("weaker entry that should be dropped first", vec![0.8, 0.6]))
            .await
            .expect("insert");

        let context = assembler
            .assemble("system", "refund", None)
            .await
            .expect("assemble")
            .context
            .expect("context");
        assert!(context.contains("closest entry"));
        assert!(!context.contains("weaker entry"));
    }

    #[tokio::test]
    async fn floor_overflow_is_a_recoverable_error() {
        let settings =
            RetrievalSettings { context_char_budget: 10, ..RetrievalSettings::default() };
        let (assembler, _fixture) = assembler(settings, false);

        let result = assembler
            .assemble("a long system prompt", "and a long query", None)
            .await;
        assert!(matches!(result, Err(RetrievalError::PromptTooLong)));
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_no_context() {
        let (assembler, fixture) = assembler(RetrievalSettings::default(), true);
        fixture.knowledge.insert(entry("unreachable", vec![1.0, 0.0])).await.expect("insert");

        let assembled = assembler
            .assemble("system", "refund", None)
            .await
            .expect("assemble");
        assert_eq!(assembled.context, None);
    }
}
