//! Environment variable loading.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ConfigError, PolicyConfig, SearchConfig, ServerConfig, TlsConfig};

/// Read a variable, treating empty and whitespace-only values as unset.
pub(super) fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(super) fn env_parse<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    env_string(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                reason: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}

/// Accepts true/false, 1/0 and yes/no, case-insensitively.
pub(super) fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    env_string(name)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                reason: format!("'{raw}' is not a boolean"),
            }),
        })
        .transpose()
}

/// Build a configuration from environment variables over defaults.
pub(super) fn load_from_env() -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    if let Some(host) = env_string("HOST") {
        config.host = host;
    }
    if let Some(port) = env_parse("PORT")? {
        config.port = port;
    }

    config.tls = match (env_string("TLS_CERT_PATH"), env_string("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => {
            return Err(ConfigError::Invalid(
                "TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string(),
            ));
        }
    };

    config.azure_openai_endpoint = env_string("AZURE_OPENAI_ENDPOINT");
    config.azure_openai_deployment = env_string("AZURE_OPENAI_REALTIME_DEPLOYMENT");
    if let Some(version) = env_string("AZURE_OPENAI_API_VERSION") {
        config.azure_openai_api_version = version;
    }
    config.azure_openai_api_key = env_string("AZURE_OPENAI_API_KEY");
    config.azure_tenant_id = env_string("AZURE_TENANT_ID");
    config.azure_client_id = env_string("AZURE_CLIENT_ID");
    config.azure_client_secret = env_string("AZURE_CLIENT_SECRET");
    if let Some(margin) = env_parse("TOKEN_REFRESH_MARGIN_SECONDS")? {
        config.token_refresh_margin_seconds = margin;
    }

    config.policy = load_policy()?;

    if let Some(timeout) = env_parse("TOOL_TIMEOUT_SECONDS")? {
        config.tool_timeout_seconds = timeout;
    }

    config.search = load_search()?;
    config.admin_api_secret = env_string("ADMIN_API_SECRET");

    config.cors_allowed_origins = env_string("CORS_ALLOWED_ORIGINS");
    if let Some(rps) = env_parse("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = env_parse("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    config.max_websocket_connections = env_parse("MAX_WEBSOCKET_CONNECTIONS")?;
    if let Some(per_ip) = env_parse("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = per_ip;
    }
    if let Some(capacity) = env_parse("EVENT_LOG_CAPACITY")? {
        config.event_log_capacity = capacity;
    }

    Ok(config)
}

fn load_policy() -> Result<PolicyConfig, ConfigError> {
    let defaults = PolicyConfig::with_defaults();
    Ok(PolicyConfig {
        voice: env_string("AZURE_OPENAI_REALTIME_VOICE_CHOICE"),
        system_message: env_string("RELAY_SYSTEM_MESSAGE"),
        model: env_string("RELAY_MODEL"),
        temperature: env_parse("RELAY_TEMPERATURE")?.or(defaults.temperature),
        top_p: env_parse("RELAY_TOP_P")?.or(defaults.top_p),
        presence_penalty: env_parse("RELAY_PRESENCE_PENALTY")?.or(defaults.presence_penalty),
        frequency_penalty: env_parse("RELAY_FREQUENCY_PENALTY")?.or(defaults.frequency_penalty),
        max_tokens: env_parse("RELAY_MAX_TOKENS")?,
        disable_audio: env_bool("RELAY_DISABLE_AUDIO")?,
    })
}

/// Search is enabled only when both endpoint and index are set.
fn load_search() -> Result<Option<SearchConfig>, ConfigError> {
    let (endpoint, index) = match (
        env_string("AZURE_SEARCH_ENDPOINT"),
        env_string("AZURE_SEARCH_INDEX"),
    ) {
        (Some(endpoint), Some(index)) => (endpoint, index),
        (None, None) => return Ok(None),
        _ => {
            return Err(ConfigError::Invalid(
                "AZURE_SEARCH_ENDPOINT and AZURE_SEARCH_INDEX must be set together".to_string(),
            ));
        }
    };

    let mut search = SearchConfig::new(endpoint, index);
    search.api_key = env_string("AZURE_SEARCH_API_KEY");
    search.semantic_configuration = env_string("AZURE_SEARCH_SEMANTIC_CONFIGURATION");
    if let Some(field) = env_string("AZURE_SEARCH_IDENTIFIER_FIELD") {
        search.identifier_field = field;
    }
    if let Some(field) = env_string("AZURE_SEARCH_CONTENT_FIELD") {
        search.content_field = field;
    }
    if let Some(field) = env_string("AZURE_SEARCH_EMBEDDING_FIELD") {
        search.embedding_field = field;
    }
    if let Some(field) = env_string("AZURE_SEARCH_TITLE_FIELD") {
        search.title_field = field;
    }
    if let Some(vector) = env_bool("AZURE_SEARCH_USE_VECTOR_QUERY")? {
        search.use_vector_query = vector;
    }
    Ok(Some(search))
}
