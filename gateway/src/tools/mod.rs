//! Server-side tools offered to the realtime model.

pub mod search;

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::config::ServerConfig;
use crate::core::events::EventSink;
use crate::core::relay::{CachedTokenProvider, ClientSecretCredential, ToolRegistry};

pub use search::{SearchAuth, SearchClient, register_search_tools};

/// Build the registry from configuration. Without search settings the
/// registry is empty and sessions run with `tool_choice: "none"`.
pub fn build_registry(config: &ServerConfig, events: Arc<dyn EventSink>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    if let Some(search) = &config.search {
        let auth = match &search.api_key {
            Some(key) => Some(SearchAuth::ApiKey(Zeroizing::new(key.clone()))),
            None => match (
                &config.azure_tenant_id,
                &config.azure_client_id,
                &config.azure_client_secret,
            ) {
                (Some(tenant), Some(client), Some(secret)) => {
                    let credential = ClientSecretCredential::new(tenant, client, secret.as_str())
                        .with_scope(search::SEARCH_SCOPE);
                    Some(SearchAuth::Bearer(Arc::new(CachedTokenProvider::new(
                        Arc::new(credential),
                        config.token_refresh_margin(),
                    ))))
                }
                _ => None,
            },
        };

        match auth {
            Some(auth) => {
                let client = SearchClient::new(search, auth, events);
                register_search_tools(&mut registry, Arc::new(client));
                tracing::info!(index = %search.index, "Knowledge base tools registered");
            }
            None => tracing::warn!(
                "Search configured without AZURE_SEARCH_API_KEY or a service principal, tools disabled"
            ),
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::core::events::NoopEventSink;

    #[test]
    fn test_no_search_means_no_tools() {
        let config = ServerConfig::default();
        assert!(build_registry(&config, Arc::new(NoopEventSink)).is_empty());
    }

    #[test]
    fn test_search_with_key_registers_both_tools() {
        let mut config = ServerConfig::default();
        let mut search = SearchConfig::new("https://s.search.windows.net", "kb");
        search.api_key = Some("k".to_string());
        config.search = Some(search);

        let registry = build_registry(&config, Arc::new(NoopEventSink));
        assert!(registry.contains("search"));
        assert!(registry.contains("report_grounding"));
        assert_eq!(registry.schemas()[1]["name"], "search");
    }

    #[test]
    fn test_search_without_credentials_is_skipped() {
        let mut config = ServerConfig::default();
        config.search = Some(SearchConfig::new("https://s.search.windows.net", "kb"));
        assert!(build_registry(&config, Arc::new(NoopEventSink)).is_empty());
    }
}
