use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use parley_db::repositories::{
    SqlConversationRepository, SqlEmbeddingStore, SqlEscalationEventRepository,
    SqlKnowledgeBankRepository, SqlMessageRepository, SqlNotificationRepository,
    SqlOutboxRepository, SqlToolRepository,
};
use parley_db::{connect_with_settings, migrations, DbPool};
use parley_engine::embedding::{EmbeddingError, EmbeddingService, HttpEmbeddingProvider};
use parley_engine::escalation::EscalationDetector;
use parley_engine::fanout::EventFanout;
use parley_engine::model::{HttpModelProvider, ModelError};
use parley_engine::orchestrator::{OrchestratorSettings, ResponseOrchestrator};
use parley_engine::realtime::TracingPublisher;
use parley_engine::retrieval::{RetrievalAssembler, RetrievalSettings};
use parley_engine::tools::ToolExecutor;
use parley_engine::worker::{OutboxWorker, WorkerHandle, WorkerSettings};

use crate::chat::AppState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
    pub worker_handle: WorkerHandle,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model provider initialization failed: {0}")]
    ModelProvider(#[source] ModelError),
    #[error("embedding provider initialization failed: {0}")]
    EmbeddingProvider(#[source] EmbeddingError),
    #[error("tool executor initialization failed: {0}")]
    ToolExecutor(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let messages = Arc::new(SqlMessageRepository::new(db_pool.clone()));
    let knowledge = Arc::new(SqlKnowledgeBankRepository::new(db_pool.clone()));
    let events = Arc::new(SqlEscalationEventRepository::new(db_pool.clone()));
    let tools = Arc::new(SqlToolRepository::new(db_pool.clone()));
    let outbox = Arc::new(SqlOutboxRepository::new(db_pool.clone()));
    let notifications = Arc::new(SqlNotificationRepository::new(db_pool.clone()));
    let embedding_store = Arc::new(SqlEmbeddingStore::new(db_pool.clone()));

    let embedding_provider = HttpEmbeddingProvider::new(
        config.embedding.base_url.clone(),
        config.embedding.model.clone(),
        config.embedding.api_key.clone(),
        Duration::from_secs(config.embedding.timeout_secs),
    )
    .map_err(BootstrapError::EmbeddingProvider)?;
    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(embedding_provider),
        embedding_store,
        config.embedding.cache_ttl_days,
    ));

    let retrieval = Arc::new(RetrievalAssembler::new(
        embeddings,
        knowledge,
        conversations.clone(),
        messages.clone(),
        RetrievalSettings {
            similarity_threshold: config.retrieval.similarity_threshold,
            max_knowledge_entries: config.retrieval.max_knowledge_entries,
            max_past_conversations: config.retrieval.max_past_conversations,
            context_char_budget: config.retrieval.context_char_budget,
            style_examples: Vec::new(),
        },
    ));

    let model = Arc::new(
        HttpModelProvider::new(
            config.model.base_url.clone(),
            config.model.model.clone(),
            config.model.api_key.clone(),
            Duration::from_secs(config.model.timeout_secs),
            config.model.max_retries,
        )
        .map_err(BootstrapError::ModelProvider)?,
    );

    let detector = Arc::new(EscalationDetector::new(conversations.clone(), events));
    let fanout = Arc::new(EventFanout::new(
        outbox.clone(),
        messages.clone(),
        config.orchestrator.summary_message_threshold,
        config.worker.max_attempts,
    ));
    let executor = ToolExecutor::new(Duration::from_secs(config.orchestrator.tool_timeout_secs))
        .map_err(BootstrapError::ToolExecutor)?;

    let orchestrator = Arc::new(ResponseOrchestrator::new(
        model.clone(),
        retrieval,
        executor,
        detector.clone(),
        conversations.clone(),
        messages.clone(),
        tools,
        fanout,
        OrchestratorSettings { max_iterations: config.orchestrator.max_iterations },
    ));

    let worker = OutboxWorker::new(
        outbox,
        conversations.clone(),
        messages.clone(),
        notifications,
        Arc::new(TracingPublisher),
        model,
        WorkerSettings {
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            batch_size: config.worker.batch_size,
            retry_base_delay_secs: 5,
        },
    );
    let worker_handle = worker.spawn();
    info!(
        event_name = "system.bootstrap.worker_started",
        correlation_id = "bootstrap",
        "outbox worker started"
    );

    let state = AppState { orchestrator, conversations, messages, detector };

    Ok(Application { config, db_pool, state, worker_handle })
}

#[cfg(test)]
mod tests {
    use parley_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use super::bootstrap;

    fn memory_options() -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_engine() {
        let app = bootstrap(memory_options()).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN \
             ('conversation', 'conversation_message', 'outbox_job', 'escalation_event')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected foundation tables after bootstrap");
        assert_eq!(table_count, 4, "bootstrap should expose baseline tables");

        app.worker_handle.stop().await;
        app.db_pool.close().await;
    }
}
