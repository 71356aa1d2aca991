use serde::Deserialize;
use std::path::PathBuf;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// This structure represents the full configuration that can be loaded from a YAML file.
/// All fields are optional to allow partial configuration. Values given here take
/// precedence over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8765
///   tls:
///     cert_path: "/etc/relay/cert.pem"
///     key_path: "/etc/relay/key.pem"
///
/// azure_openai:
///   endpoint: "https://myresource.openai.azure.com"
///   deployment: "gpt-4o-realtime-preview"
///   api_version: "2024-10-01-preview"
///   api_key: "your-api-key"
///   # or a service principal
///   tenant_id: "..."
///   client_id: "..."
///   client_secret: "..."
///   token_refresh_margin_seconds: 300
///
/// policy:
///   voice: "coral"
///   system_message: "You are a helpful assistant."
///   temperature: 0.8
///   top_p: 0.9
///   presence_penalty: 0.4
///   frequency_penalty: 0.2
///   max_tokens: 800
///   disable_audio: false
///
/// tools:
///   timeout_seconds: 30
///
/// search:
///   endpoint: "https://mysearch.search.windows.net"
///   index: "knowledge"
///   api_key: "search-key"
///   semantic_configuration: "default"
///   identifier_field: "chunk_id"
///   content_field: "chunk"
///   embedding_field: "text_vector"
///   title_field: "title"
///   use_vector_query: true
///
/// admin:
///   api_secret: "admin-secret"
///
/// security:
///   cors_allowed_origins: "https://app.example.com"
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///   max_websocket_connections: 500
///   max_connections_per_ip: 100
///
/// events:
///   log_capacity: 1000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub azure_openai: Option<AzureOpenAiYaml>,
    pub policy: Option<PolicyYaml>,
    pub tools: Option<ToolsYaml>,
    pub search: Option<SearchYaml>,
    pub admin: Option<AdminYaml>,
    pub security: Option<SecurityYaml>,
    pub events: Option<EventsYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Realtime endpoint and credentials from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AzureOpenAiYaml {
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub api_key: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_refresh_margin_seconds: Option<u64>,
}

/// Initial session policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PolicyYaml {
    pub voice: Option<String>,
    pub system_message: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub max_tokens: Option<u32>,
    pub disable_audio: Option<bool>,
}

/// Tool execution settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsYaml {
    /// 0 disables the timeout
    pub timeout_seconds: Option<u64>,
}

/// Knowledge base search from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SearchYaml {
    pub endpoint: Option<String>,
    pub index: Option<String>,
    pub api_key: Option<String>,
    pub semantic_configuration: Option<String>,
    pub identifier_field: Option<String>,
    pub content_field: Option<String>,
    pub embedding_field: Option<String>,
    pub title_field: Option<String>,
    pub use_vector_query: Option<bool>,
}

/// Admin surface from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminYaml {
    pub api_secret: Option<String>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

/// Event log from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EventsYaml {
    pub log_capacity: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Result<Self, ConfigError>` - The loaded configuration or an error
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            source: e,
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9000
  tls:
    cert_path: "/certs/cert.pem"
    key_path: "/certs/key.pem"

azure_openai:
  endpoint: "https://myres.openai.azure.com"
  deployment: "rt"
  tenant_id: "t"
  client_id: "c"
  client_secret: "s"

policy:
  voice: "sage"
  system_message: "Answer in English"
  max_tokens: 400

tools:
  timeout_seconds: 0

search:
  endpoint: "https://search.example.net"
  index: "kb"
  semantic_configuration: "default"

admin:
  api_secret: "admin"

security:
  max_websocket_connections: 50

events:
  log_capacity: 200
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let server = config.server.as_ref().unwrap();
        assert_eq!(server.port, Some(9000));
        assert_eq!(
            server.tls.as_ref().unwrap().cert_path.as_deref(),
            Some("/certs/cert.pem")
        );

        let azure = config.azure_openai.as_ref().unwrap();
        assert_eq!(azure.deployment.as_deref(), Some("rt"));
        assert_eq!(azure.api_key, None);
        assert_eq!(azure.client_secret.as_deref(), Some("s"));

        let policy = config.policy.as_ref().unwrap();
        assert_eq!(policy.voice.as_deref(), Some("sage"));
        assert_eq!(policy.max_tokens, Some(400));
        assert_eq!(policy.temperature, None);

        assert_eq!(config.tools.as_ref().unwrap().timeout_seconds, Some(0));
        assert_eq!(
            config.search.as_ref().unwrap().semantic_configuration.as_deref(),
            Some("default")
        );
        assert_eq!(
            config.admin.as_ref().unwrap().api_secret.as_deref(),
            Some("admin")
        );
        assert_eq!(
            config.security.as_ref().unwrap().max_websocket_connections,
            Some(50)
        );
        assert_eq!(config.events.as_ref().unwrap().log_capacity, Some(200));
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.server.is_none());
        assert!(config.azure_openai.is_none());
        assert!(config.search.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server:\n  host: \"localhost\"\n  port: 3000\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();

        assert_eq!(
            config.server.as_ref().unwrap().host,
            Some("localhost".to_string())
        );
        assert_eq!(config.server.as_ref().unwrap().port, Some(3000));
    }

    #[test]
    fn test_from_file_not_found() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let result = YamlConfig::from_file(&path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");

        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
