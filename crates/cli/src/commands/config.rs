use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use signoff_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let identity_token = config
        .identity
        .api_token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let fields: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "SIGNOFF_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "SIGNOFF_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "SIGNOFF_DATABASE_TIMEOUT_SECS",
        ),
        ("server.bind_address", config.server.bind_address.clone(), "SIGNOFF_SERVER_BIND_ADDRESS"),
        ("server.port", config.server.port.to_string(), "SIGNOFF_SERVER_PORT"),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "SIGNOFF_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        (
            "identity.base_url",
            config.identity.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "SIGNOFF_IDENTITY_BASE_URL",
        ),
        ("identity.api_token", identity_token, "SIGNOFF_IDENTITY_API_TOKEN"),
        (
            "identity.timeout_secs",
            config.identity.timeout_secs.to_string(),
            "SIGNOFF_IDENTITY_TIMEOUT_SECS",
        ),
        ("scheduler.enabled", config.scheduler.enabled.to_string(), "SIGNOFF_SCHEDULER_ENABLED"),
        (
            "scheduler.poll_interval_secs",
            config.scheduler.poll_interval_secs.to_string(),
            "SIGNOFF_SCHEDULER_POLL_INTERVAL_SECS",
        ),
        (
            "scheduler.max_backoff_secs",
            config.scheduler.max_backoff_secs.to_string(),
            "SIGNOFF_SCHEDULER_MAX_BACKOFF_SECS",
        ),
        (
            "scheduler.batch_size",
            config.scheduler.batch_size.to_string(),
            "SIGNOFF_SCHEDULER_BATCH_SIZE",
        ),
        ("logging.level", config.logging.level.clone(), "SIGNOFF_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "SIGNOFF_LOGGING_FORMAT"),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in fields {
        let source = field_source(
            key,
            Some(env_key),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["signoff.toml", "config/signoff.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps at most the first four characters of a secret.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.len() <= 8 {
        return "<redacted>".to_string();
    }

    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}
