//! Configuration validation logic.

use super::{ConfigError, ServerConfig};

/// Validate a merged configuration.
pub(super) fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    validate_upstream(config)?;
    validate_credentials(config)?;
    validate_tls(config)?;
    validate_policy(config)?;
    validate_limits(config)?;
    Ok(())
}

pub(super) fn validate_upstream(config: &ServerConfig) -> Result<(), ConfigError> {
    let endpoint = config
        .azure_openai_endpoint
        .as_deref()
        .ok_or_else(|| ConfigError::Missing("AZURE_OPENAI_ENDPOINT".to_string()))?;
    if config.azure_openai_deployment.is_none() {
        return Err(ConfigError::Missing(
            "AZURE_OPENAI_REALTIME_DEPLOYMENT".to_string(),
        ));
    }

    let url = url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidValue {
        name: "AZURE_OPENAI_ENDPOINT".to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "https" | "http" | "wss" | "ws") {
        return Err(ConfigError::InvalidValue {
            name: "AZURE_OPENAI_ENDPOINT".to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

/// Either an API key or a complete service principal is required.
pub(super) fn validate_credentials(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.azure_openai_api_key.is_some() {
        return Ok(());
    }

    let parts = [
        config.azure_tenant_id.is_some(),
        config.azure_client_id.is_some(),
        config.azure_client_secret.is_some(),
    ];
    if parts.iter().all(|set| *set) {
        return Ok(());
    }
    if parts.iter().any(|set| *set) {
        return Err(ConfigError::Invalid(
            "AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_CLIENT_SECRET must all be set".to_string(),
        ));
    }
    Err(ConfigError::Missing(
        "AZURE_OPENAI_API_KEY or a service principal".to_string(),
    ))
}

pub(super) fn validate_tls(config: &ServerConfig) -> Result<(), ConfigError> {
    let Some(tls) = &config.tls else {
        return Ok(());
    };
    for (name, path) in [("certificate", &tls.cert_path), ("private key", &tls.key_path)] {
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "TLS {name} not found: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

pub(super) fn validate_policy(config: &ServerConfig) -> Result<(), ConfigError> {
    config.policy_settings()?;

    let policy = &config.policy;
    for (name, value, min, max) in [
        ("temperature", policy.temperature, 0.0, 2.0),
        ("top_p", policy.top_p, 0.0, 1.0),
        ("presence_penalty", policy.presence_penalty, -2.0, 2.0),
        ("frequency_penalty", policy.frequency_penalty, -2.0, 2.0),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < min || v > max {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    reason: format!("{v} is not within [{min}, {max}]"),
                });
            }
        }
    }
    Ok(())
}

pub(super) fn validate_limits(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.rate_limit_requests_per_second == 0 {
        return Err(ConfigError::InvalidValue {
            name: "RATE_LIMIT_REQUESTS_PER_SECOND".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if config.rate_limit_burst_size == 0 {
        return Err(ConfigError::InvalidValue {
            name: "RATE_LIMIT_BURST_SIZE".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if config.event_log_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            name: "EVENT_LOG_CAPACITY".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}
