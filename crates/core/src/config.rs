use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub model: ModelConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub orchestrator: OrchestratorConfig,
    pub worker: WorkerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub cache_ttl_days: i64,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub similarity_threshold: f32,
    pub max_knowledge_entries: usize,
    pub max_past_conversations: usize,
    pub context_char_budget: usize,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub tool_timeout_secs: u64,
    pub summary_message_threshold: usize,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub model_api_key: Option<String>,
    pub model_base_url: Option<String>,
    pub model_name: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: Option<String>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://parley.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            model: ModelConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
            },
            embedding: EmbeddingConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "text-embedding-3-small".to_string(),
                timeout_secs: 30,
                cache_ttl_days: 30,
            },
            retrieval: RetrievalConfig {
                similarity_threshold: 0.6,
                max_knowledge_entries: 5,
                max_past_conversations: 5,
                context_char_budget: 24_000,
            },
            orchestrator: OrchestratorConfig {
                max_iterations: 5,
                tool_timeout_secs: 15,
                summary_message_threshold: 4,
            },
            worker: WorkerConfig { poll_interval_ms: 500, batch_size: 10, max_attempts: 3 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    model: Option<ModelPatch>,
    embedding: Option<EmbeddingPatch>,
    retrieval: Option<RetrievalPatch>,
    orchestrator: Option<OrchestratorPatch>,
    worker: Option<WorkerPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    cache_ttl_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    similarity_threshold: Option<f32>,
    max_knowledge_entries: Option<usize>,
    max_past_conversations: Option<usize>,
    context_char_budget: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    max_iterations: Option<u32>,
    tool_timeout_secs: Option<u64>,
    summary_message_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    poll_interval_ms: Option<u64>,
    batch_size: Option<usize>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("parley.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(model) = patch.model {
            if let Some(api_key_value) = model.api_key {
                self.model.api_key = Some(secret_value(api_key_value));
            }
            if let Some(base_url) = model.base_url {
                self.model.base_url = base_url;
            }
            if let Some(name) = model.model {
                self.model.model = name;
            }
            if let Some(timeout_secs) = model.timeout_secs {
                self.model.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = model.max_retries {
                self.model.max_retries = max_retries;
            }
        }

        if let Some(embedding) = patch.embedding {
            if let Some(api_key_value) = embedding.api_key {
                self.embedding.api_key = Some(secret_value(api_key_value));
            }
            if let Some(base_url) = embedding.base_url {
                self.embedding.base_url = base_url;
            }
            if let Some(name) = embedding.model {
                self.embedding.model = name;
            }
            if let Some(timeout_secs) = embedding.timeout_secs {
                self.embedding.timeout_secs = timeout_secs;
            }
            if let Some(cache_ttl_days) = embedding.cache_ttl_days {
                self.embedding.cache_ttl_days = cache_ttl_days;
            }
        }

        if let Some(retrieval) = patch.retrieval {
            if let Some(similarity_threshold) = retrieval.similarity_threshold {
                self.retrieval.similarity_threshold = similarity_threshold;
            }
            if let Some(max_knowledge_entries) = retrieval.max_knowledge_entries {
                self.retrieval.max_knowledge_entries = max_knowledge_entries;
            }
            if let Some(max_past_conversations) = retrieval.max_past_conversations {
                self.retrieval.max_past_conversations = max_past_conversations;
            }
            if let Some(context_char_budget) = retrieval.context_char_budget {
                self.retrieval.context_char_budget = context_char_budget;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(max_iterations) = orchestrator.max_iterations {
                self.orchestrator.max_iterations = max_iterations;
            }
            if let Some(tool_timeout_secs) = orchestrator.tool_timeout_secs {
                self.orchestrator.tool_timeout_secs = tool_timeout_secs;
            }
            if let Some(summary_message_threshold) = orchestrator.summary_message_threshold {
                self.orchestrator.summary_message_threshold = summary_message_threshold;
            }
        }

        if let Some(worker) = patch.worker {
            if let Some(poll_interval_ms) = worker.poll_interval_ms {
                self.worker.poll_interval_ms = poll_interval_ms;
            }
            if let Some(batch_size) = worker.batch_size {
                self.worker.batch_size = batch_size;
            }
            if let Some(max_attempts) = worker.max_attempts {
                self.worker.max_attempts = max_attempts;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PARLEY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PARLEY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PARLEY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_MODEL_API_KEY") {
            self.model.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PARLEY_MODEL_BASE_URL") {
            self.model.base_url = value;
        }
        if let Some(value) = read_env("PARLEY_MODEL_NAME") {
            self.model.model = value;
        }
        if let Some(value) = read_env("PARLEY_MODEL_TIMEOUT_SECS") {
            self.model.timeout_secs = parse_u64("PARLEY_MODEL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_MODEL_MAX_RETRIES") {
            self.model.max_retries = parse_u32("PARLEY_MODEL_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("PARLEY_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PARLEY_EMBEDDING_BASE_URL") {
            self.embedding.base_url = value;
        }
        if let Some(value) = read_env("PARLEY_EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = read_env("PARLEY_EMBEDDING_CACHE_TTL_DAYS") {
            self.embedding.cache_ttl_days = parse_i64("PARLEY_EMBEDDING_CACHE_TTL_DAYS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_RETRIEVAL_SIMILARITY_THRESHOLD") {
            self.retrieval.similarity_threshold =
                parse_f32("PARLEY_RETRIEVAL_SIMILARITY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("PARLEY_ORCHESTRATOR_MAX_ITERATIONS") {
            self.orchestrator.max_iterations =
                parse_u32("PARLEY_ORCHESTRATOR_MAX_ITERATIONS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PARLEY_SERVER_PORT") {
            self.server.port = parse_u16("PARLEY_SERVER_PORT", &value)?;
        }

        let log_level = read_env("PARLEY_LOGGING_LEVEL").or_else(|| read_env("PARLEY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PARLEY_LOGGING_FORMAT").or_else(|| read_env("PARLEY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(api_key) = overrides.model_api_key {
            self.model.api_key = Some(secret_value(api_key));
        }
        if let Some(base_url) = overrides.model_base_url {
            self.model.base_url = base_url;
        }
        if let Some(model_name) = overrides.model_name {
            self.model.model = model_name;
        }
        if let Some(api_key) = overrides.embedding_api_key {
            self.embedding.api_key = Some(secret_value(api_key));
        }
        if let Some(base_url) = overrides.embedding_base_url {
            self.embedding.base_url = base_url;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.model.model.trim().is_empty() {
            return Err(ConfigError::Validation("model.model must not be empty".to_string()));
        }
        if self.model.timeout_secs == 0 {
            return Err(ConfigError::Validation("model.timeout_secs must be positive".to_string()));
        }
        if self.embedding.cache_ttl_days <= 0 {
            return Err(ConfigError::Validation(
                "embedding.cache_ttl_days must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(ConfigError::Validation(format!(
                "retrieval.similarity_threshold must be within [0, 1], got {}",
                self.retrieval.similarity_threshold
            )));
        }
        if self.retrieval.context_char_budget == 0 {
            return Err(ConfigError::Validation(
                "retrieval.context_char_budget must be positive".to_string(),
            ));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.tool_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.tool_timeout_secs must be positive".to_string(),
            ));
        }
        if self.worker.batch_size == 0 || self.worker.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "worker.batch_size and worker.max_attempts must be positive".to_string(),
            ));
        }
        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.bind_address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }
        output.push(ch);
    }

    Ok(output)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.trim().parse::<f32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}
