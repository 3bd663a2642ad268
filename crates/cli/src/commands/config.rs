use parley_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let mut lines =
        vec!["effective config (source precedence: overrides > env > file > default):".to_string()];

    lines.push(render_line("database.url", &config.database.url));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
    ));
    lines.push(render_line("model.base_url", &config.model.base_url));
    lines.push(render_line("model.model", &config.model.model));
    lines.push(render_line("model.api_key", redact(config.model.api_key.is_some())));
    lines.push(render_line("model.timeout_secs", &config.model.timeout_secs.to_string()));
    lines.push(render_line("model.max_retries", &config.model.max_retries.to_string()));
    lines.push(render_line("embedding.base_url", &config.embedding.base_url));
    lines.push(render_line("embedding.model", &config.embedding.model));
    lines.push(render_line("embedding.api_key", redact(config.embedding.api_key.is_some())));
    lines.push(render_line(
        "embedding.cache_ttl_days",
        &config.embedding.cache_ttl_days.to_string(),
    ));
    lines.push(render_line(
        "retrieval.similarity_threshold",
        &config.retrieval.similarity_threshold.to_string(),
    ));
    lines.push(render_line(
        "retrieval.max_knowledge_entries",
        &config.retrieval.max_knowledge_entries.to_string(),
    ));
    lines.push(render_line(
        "retrieval.max_past_conversations",
        &config.retrieval.max_past_conversations.to_string(),
    ));
    lines.push(render_line(
        "retrieval.context_char_budget",
        &config.retrieval.context_char_budget.to_string(),
    ));
    lines.push(render_line(
        "orchestrator.max_iterations",
        &config.orchestrator.max_iterations.to_string(),
    ));
    lines.push(render_line(
        "orchestrator.tool_timeout_secs",
        &config.orchestrator.tool_timeout_secs.to_string(),
    ));
    lines.push(render_line(
        "orchestrator.summary_message_threshold",
        &config.orchestrator.summary_message_threshold.to_string(),
    ));
    lines.push(render_line("worker.poll_interval_ms", &config.worker.poll_interval_ms.to_string()));
    lines.push(render_line("worker.max_attempts", &config.worker.max_attempts.to_string()));
    lines.push(render_line("server.bind_address", &config.server.bind_address));
    lines.push(render_line("server.port", &config.server.port.to_string()));
    lines.push(render_line("logging.level", &config.logging.level));

    lines.join("\n")
}

fn render_line(key: &str, value: &str) -> String {
    format!("  {key} = {value}")
}

fn redact(present: bool) -> &'static str {
    if present {
        "[redacted]"
    } else {
        "[not set]"
    }
}
