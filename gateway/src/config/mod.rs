//! Configuration module for the realtime relay
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use realtime_relay::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::relay::{
    DEFAULT_API_VERSION, PolicySettings, RealtimeVoice, UpstreamConfig,
};

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8765;

/// Default tool invocation timeout in seconds
pub const DEFAULT_TOOL_TIMEOUT_SECONDS: u64 = 30;

/// Default margin before token expiry at which the token is refreshed
pub const DEFAULT_TOKEN_REFRESH_MARGIN_SECONDS: u64 = 300;

/// Default number of events kept for the admin events endpoint
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1000;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Initial session policy values
///
/// Every field is optional; unset fields leave the client's value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyConfig {
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

impl PolicyConfig {
    /// Defaults used when nothing is configured
    pub fn with_defaults() -> Self {
        Self {
            temperature: Some(0.8),
            top_p: Some(0.9),
            presence_penalty: Some(0.4),
            frequency_penalty: Some(0.2),
            ..Default::default()
        }
    }
}

/// Azure AI Search settings for the knowledge base tools
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub endpoint: String,
    pub index: String,
    pub api_key: Option<String>,
    pub semantic_configuration: Option<String>,
    pub identifier_field: String,
    pub content_field: String,
    pub embedding_field: String,
    pub title_field: String,
    pub use_vector_query: bool,
}

impl SearchConfig {
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            index: index.into(),
            api_key: None,
            semantic_configuration: None,
            identifier_field: "chunk_id".to_string(),
            content_field: "chunk".to_string(),
            embedding_field: "text_vector".to_string(),
            title_field: "title".to_string(),
            use_vector_query: true,
        }
    }
}

/// Server configuration
///
/// Contains all configuration needed to run the relay, including:
/// - Server settings (host, port, TLS)
/// - Realtime endpoint coordinates and credentials
/// - Initial session policy
/// - Knowledge base search settings
/// - Admin authentication
/// - Security settings (CORS, rate limiting, connection limits)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Realtime endpoint
    pub azure_openai_endpoint: Option<String>,
    pub azure_openai_deployment: Option<String>,
    pub azure_openai_api_version: String,
    /// Static key; when absent the service principal below is used
    pub azure_openai_api_key: Option<String>,

    // Service principal for bearer authentication
    pub azure_tenant_id: Option<String>,
    pub azure_client_id: Option<String>,
    pub azure_client_secret: Option<String>,
    pub token_refresh_margin_seconds: u64,

    /// Initial session policy
    pub policy: PolicyConfig,

    /// Per-tool timeout; 0 disables it
    pub tool_timeout_seconds: u64,

    /// Knowledge base tools are registered only when this is present
    pub search: Option<SearchConfig>,

    /// Bearer secret protecting the admin endpoints; open when None
    pub admin_api_secret: Option<String>,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,

    // Rate limiting configuration
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,

    /// Events kept for the admin events endpoint
    pub event_log_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tls: None,
            azure_openai_endpoint: None,
            azure_openai_deployment: None,
            azure_openai_api_version: DEFAULT_API_VERSION.to_string(),
            azure_openai_api_key: None,
            azure_tenant_id: None,
            azure_client_id: None,
            azure_client_secret: None,
            token_refresh_margin_seconds: DEFAULT_TOKEN_REFRESH_MARGIN_SECONDS,
            policy: PolicyConfig::with_defaults(),
            tool_timeout_seconds: DEFAULT_TOOL_TIMEOUT_SECONDS,
            search: None,
            admin_api_secret: None,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
        }
    }
}

/// Implement Drop to zeroize all secret fields when ServerConfig is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.azure_openai_api_key {
            key.zeroize();
        }
        if let Some(ref mut secret) = self.azure_client_secret {
            secret.zeroize();
        }
        if let Some(ref mut secret) = self.admin_api_secret {
            secret.zeroize();
        }
        if let Some(ref mut search) = self.search {
            if let Some(ref mut key) = search.api_key {
                key.zeroize();
            }
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// The .env file is loaded in main.rs at startup, so its values are already
    /// visible as environment variables here. Validation runs on the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Check if the admin endpoints require a bearer secret
    pub fn has_admin_auth(&self) -> bool {
        self.admin_api_secret.is_some()
    }

    /// Check if a service principal is fully configured
    pub fn has_service_principal(&self) -> bool {
        self.azure_tenant_id.is_some()
            && self.azure_client_id.is_some()
            && self.azure_client_secret.is_some()
    }

    /// Upstream endpoint coordinates, when configured
    pub fn upstream_config(&self) -> Option<UpstreamConfig> {
        let endpoint = self.azure_openai_endpoint.as_ref()?;
        let deployment = self.azure_openai_deployment.as_ref()?;
        Some(
            UpstreamConfig::new(endpoint.as_str(), deployment.as_str())
                .with_api_version(self.azure_openai_api_version.as_str()),
        )
    }

    /// Tool invocation bound; `None` when disabled
    pub fn tool_timeout(&self) -> Option<Duration> {
        match self.tool_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_seconds)
    }

    /// Initial session policy
    pub fn policy_settings(&self) -> Result<PolicySettings, ConfigError> {
        let voice = match &self.policy.voice {
            Some(name) => Some(RealtimeVoice::parse(name).ok_or_else(|| {
                ConfigError::InvalidValue {
                    name: "AZURE_OPENAI_REALTIME_VOICE_CHOICE".to_string(),
                    reason: format!(
                        "'{name}' is not one of: {}",
                        RealtimeVoice::names().join(", ")
                    ),
                }
            })?),
            None => None,
        };

        Ok(PolicySettings {
            model: self.policy.model.clone(),
            system_message: self.policy.system_message.clone(),
            temperature: self.policy.temperature,
            top_p: self.policy.top_p,
            presence_penalty: self.policy.presence_penalty,
            frequency_penalty: self.policy.frequency_penalty,
            max_tokens: self.policy.max_tokens,
            disable_audio: self.policy.disable_audio,
            voice,
        })
    }
}
