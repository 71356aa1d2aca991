//! Merging YAML values over the environment.

use std::path::PathBuf;

use super::env::load_from_env;
use super::yaml::YamlConfig;
use super::{ConfigError, SearchConfig, ServerConfig, TlsConfig};

/// Load the environment layer, then overlay any values present in the YAML file.
pub(super) fn merge_config(yaml: Option<YamlConfig>) -> Result<ServerConfig, ConfigError> {
    let mut config = load_from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            if tls.enabled == Some(false) {
                config.tls = None;
            } else {
                match (tls.cert_path, tls.key_path) {
                    (Some(cert), Some(key)) => {
                        config.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        });
                    }
                    (None, None) => {}
                    _ => {
                        return Err(ConfigError::Invalid(
                            "server.tls.cert_path and server.tls.key_path must be set together"
                                .to_string(),
                        ));
                    }
                }
            }
        }
    }

    if let Some(azure) = yaml.azure_openai {
        overlay(&mut config.azure_openai_endpoint, azure.endpoint);
        overlay(&mut config.azure_openai_deployment, azure.deployment);
        if let Some(version) = azure.api_version {
            config.azure_openai_api_version = version;
        }
        overlay(&mut config.azure_openai_api_key, azure.api_key);
        overlay(&mut config.azure_tenant_id, azure.tenant_id);
        overlay(&mut config.azure_client_id, azure.client_id);
        overlay(&mut config.azure_client_secret, azure.client_secret);
        if let Some(margin) = azure.token_refresh_margin_seconds {
            config.token_refresh_margin_seconds = margin;
        }
    }

    if let Some(policy) = yaml.policy {
        let target = &mut config.policy;
        overlay(&mut target.voice, policy.voice);
        overlay(&mut target.system_message, policy.system_message);
        overlay(&mut target.model, policy.model);
        overlay(&mut target.temperature, policy.temperature);
        overlay(&mut target.top_p, policy.top_p);
        overlay(&mut target.presence_penalty, policy.presence_penalty);
        overlay(&mut target.frequency_penalty, policy.frequency_penalty);
        overlay(&mut target.max_tokens, policy.max_tokens);
        overlay(&mut target.disable_audio, policy.disable_audio);
    }

    if let Some(timeout) = yaml.tools.and_then(|t| t.timeout_seconds) {
        config.tool_timeout_seconds = timeout;
    }

    if let Some(search) = yaml.search {
        let base = config.search.take();
        let endpoint = search
            .endpoint
            .or_else(|| base.as_ref().map(|b| b.endpoint.clone()));
        let index = search
            .index
            .or_else(|| base.as_ref().map(|b| b.index.clone()));

        config.search = match (endpoint, index) {
            (Some(endpoint), Some(index)) => {
                let mut merged = base.unwrap_or_else(|| SearchConfig::new("", ""));
                merged.endpoint = endpoint;
                merged.index = index;
                overlay(&mut merged.api_key, search.api_key);
                overlay(
                    &mut merged.semantic_configuration,
                    search.semantic_configuration,
                );
                if let Some(field) = search.identifier_field {
                    merged.identifier_field = field;
                }
                if let Some(field) = search.content_field {
                    merged.content_field = field;
                }
                if let Some(field) = search.embedding_field {
                    merged.embedding_field = field;
                }
                if let Some(field) = search.title_field {
                    merged.title_field = field;
                }
                if let Some(vector) = search.use_vector_query {
                    merged.use_vector_query = vector;
                }
                Some(merged)
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "search.endpoint and search.index must be set together".to_string(),
                ));
            }
        };
    }

    if let Some(admin) = yaml.admin {
        overlay(&mut config.admin_api_secret, admin.api_secret);
    }

    if let Some(security) = yaml.security {
        overlay(&mut config.cors_allowed_origins, security.cors_allowed_origins);
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        overlay(
            &mut config.max_websocket_connections,
            security.max_websocket_connections,
        );
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    if let Some(capacity) = yaml.events.and_then(|e| e.log_capacity) {
        config.event_log_capacity = capacity;
    }

    Ok(config)
}

fn overlay<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::cleanup_env_vars;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_merge_without_yaml_is_env() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "7000");
        }
        let config = merge_config(None).unwrap();
        assert_eq!(config.port, 7000);
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_yaml_search_fields_over_env_search() {
        cleanup_env_vars();
        unsafe {
            env::set_var("AZURE_SEARCH_ENDPOINT", "https://env.search.windows.net");
            env::set_var("AZURE_SEARCH_INDEX", "env-index");
            env::set_var("AZURE_SEARCH_API_KEY", "env-search-key");
        }
        let yaml: YamlConfig = serde_yaml::from_str(
            r#"
search:
  index: "yaml-index"
  title_field: "name"
"#,
        )
        .unwrap();

        let config = merge_config(Some(yaml)).unwrap();
        let search = config.search.clone().unwrap();
        assert_eq!(search.endpoint, "https://env.search.windows.net");
        assert_eq!(search.index, "yaml-index");
        assert_eq!(search.api_key.as_deref(), Some("env-search-key"));
        assert_eq!(search.title_field, "name");
        assert_eq!(search.content_field, "chunk");
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_yaml_tls_disabled_clears_env_tls() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TLS_CERT_PATH", "/c.pem");
            env::set_var("TLS_KEY_PATH", "/k.pem");
        }
        let yaml: YamlConfig =
            serde_yaml::from_str("server:\n  tls:\n    enabled: false\n").unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert!(!config.is_tls_enabled());
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_yaml_policy_overrides_defaults() {
        cleanup_env_vars();
        let yaml: YamlConfig = serde_yaml::from_str(
            r#"
policy:
  temperature: 0.6
  disable_audio: true
"#,
        )
        .unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert_eq!(config.policy.temperature, Some(0.6));
        assert_eq!(config.policy.top_p, Some(0.9));
        assert_eq!(config.policy.disable_audio, Some(true));
        cleanup_env_vars();
    }
}
