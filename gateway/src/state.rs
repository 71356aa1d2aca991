//! Shared application state.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::config::ServerConfig;
use crate::core::events::{EventLog, EventSink};
use crate::core::relay::{
    CachedTokenProvider, ClientSecretCredential, MessageTransformer, SessionPolicy, ToolRegistry,
    UpstreamAuth, UpstreamConnector,
};
use crate::errors::AppResult;
use crate::tools;

/// Why a WebSocket connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

/// A reserved session slot. The slot is released when the guard is dropped,
/// whichever way the connection ends.
pub struct ConnectionSlot {
    state: Arc<AppState>,
    ip: IpAddr,
}

impl ConnectionSlot {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot").field("ip", &self.ip).finish()
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.release_connection(self.ip);
        tracing::debug!(ip = %self.ip, "Connection slot released");
    }
}

/// State shared by every request and session.
pub struct AppState {
    pub config: ServerConfig,
    pub tools: Arc<ToolRegistry>,
    pub policy: Arc<SessionPolicy>,
    pub event_log: Arc<EventLog>,
    /// `None` when no realtime endpoint is configured; sessions are refused.
    pub upstream: Option<UpstreamConnector>,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, u32>,
}

impl AppState {
    /// Build the state from configuration: event log, tools, policy and the
    /// upstream connector.
    pub fn new(config: ServerConfig) -> AppResult<Arc<Self>> {
        let event_log = Arc::new(EventLog::new(config.event_log_capacity));
        let registry = tools::build_registry(&config, event_log.clone());
        let upstream = upstream_connector(&config)?;
        Self::from_parts(config, event_log, registry, upstream)
    }

    /// Assemble the state from already-built parts.
    pub fn from_parts(
        config: ServerConfig,
        event_log: Arc<EventLog>,
        registry: ToolRegistry,
        upstream: Option<UpstreamConnector>,
    ) -> AppResult<Arc<Self>> {
        let policy = SessionPolicy::new(config.policy_settings()?);

        tracing::info!(
            tools = ?registry.names(),
            upstream = upstream.as_ref().map(|u| u.url().as_str()).unwrap_or("-"),
            "Application state initialized"
        );

        Ok(Arc::new(Self {
            config,
            tools: Arc::new(registry),
            policy: Arc::new(policy),
            event_log,
            upstream,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        }))
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        self.event_log.clone()
    }

    /// Transformer for a new session.
    pub fn transformer(&self) -> MessageTransformer {
        MessageTransformer::new(self.tools.clone(), self.policy.clone(), self.events())
            .with_tool_timeout(self.config.tool_timeout())
    }

    /// Reserve a connection slot for `ip`.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        match self.config.max_websocket_connections {
            Some(max) => {
                let acquired = self
                    .ws_connections
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    });
                if acquired.is_err() {
                    let unused = *per_ip == 0;
                    drop(per_ip);
                    if unused {
                        self.ip_connections.remove_if(&ip, |_, count| *count == 0);
                    }
                    return Err(ConnectionLimitError::GlobalLimitReached);
                }
            }
            None => {
                self.ws_connections.fetch_add(1, Ordering::SeqCst);
            }
        }

        *per_ip += 1;
        Ok(())
    }

    /// Reserve a connection slot for `ip`, held by the returned guard.
    pub fn acquire_slot(
        self: &Arc<Self>,
        ip: IpAddr,
    ) -> Result<ConnectionSlot, ConnectionLimitError> {
        self.try_acquire_connection(ip)?;
        Ok(ConnectionSlot {
            state: self.clone(),
            ip,
        })
    }

    /// Release a slot taken by [`try_acquire_connection`](Self::try_acquire_connection).
    pub fn release_connection(&self, ip: IpAddr) {
        if let Some(mut count) = self.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.ip_connections.remove_if(&ip, |_, count| *count == 0);

        let _ = self
            .ws_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> u32 {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }
}

/// Connector for the configured endpoint: API key when present, otherwise a
/// cached service principal token.
fn upstream_connector(config: &ServerConfig) -> AppResult<Option<UpstreamConnector>> {
    let Some(upstream) = config.upstream_config() else {
        tracing::warn!("No realtime endpoint configured, sessions will be refused");
        return Ok(None);
    };

    let auth = if let Some(key) = &config.azure_openai_api_key {
        tracing::info!("Using API key for the realtime endpoint");
        UpstreamAuth::ApiKey(Zeroizing::new(key.clone()))
    } else if let (Some(tenant), Some(client), Some(secret)) = (
        &config.azure_tenant_id,
        &config.azure_client_id,
        &config.azure_client_secret,
    ) {
        tracing::info!(tenant_id = %tenant, "Using service principal for the realtime endpoint");
        let credential = ClientSecretCredential::new(tenant, client, secret.as_str());
        UpstreamAuth::Bearer(Arc::new(CachedTokenProvider::new(
            Arc::new(credential),
            config.token_refresh_margin(),
        )))
    } else {
        tracing::warn!("No credentials for the realtime endpoint, sessions will be refused");
        return Ok(None);
    };

    Ok(Some(UpstreamConnector::new(upstream, auth)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::RealtimeVoice;
    use std::net::Ipv4Addr;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.max_websocket_connections = Some(10);
        config.max_connections_per_ip = 3;
        config
    }

    #[test]
    fn test_connection_tracking_basic() {
        let state = AppState::new(config()).unwrap();
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 100).into();

        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);

        for n in 1..=3 {
            assert!(state.try_acquire_connection(ip).is_ok());
            assert_eq!(state.ws_connection_count(), n);
            assert_eq!(state.ip_connection_count(&ip), n as u32);
        }

        assert_eq!(
            state.try_acquire_connection(ip),
            Err(ConnectionLimitError::PerIpLimitReached)
        );

        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 2);
        assert_eq!(state.ip_connection_count(&ip), 2);

        assert!(state.try_acquire_connection(ip).is_ok());
        assert_eq!(state.ws_connection_count(), 3);
    }

    #[test]
    fn test_global_connection_limit() {
        let mut config = config();
        config.max_websocket_connections = Some(5);
        config.max_connections_per_ip = 10;
        let state = AppState::new(config).unwrap();

        let ips: Vec<IpAddr> = (1..=6)
            .map(|i| Ipv4Addr::new(192, 168, 1, i).into())
            .collect();

        for ip in &ips[0..5] {
            assert!(state.try_acquire_connection(*ip).is_ok());
        }
        assert_eq!(state.ws_connection_count(), 5);

        assert_eq!(
            state.try_acquire_connection(ips[5]),
            Err(ConnectionLimitError::GlobalLimitReached)
        );
        assert_eq!(state.ip_connection_count(&ips[5]), 0);

        state.release_connection(ips[0]);
        assert!(state.try_acquire_connection(ips[5]).is_ok());
    }

    #[test]
    fn test_release_never_underflows() {
        let state = AppState::new(config()).unwrap();
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);
    }

    #[test]
    fn test_slot_released_on_drop() {
        let state = AppState::new(config()).unwrap();
        let ip: IpAddr = Ipv4Addr::new(10, 0, 0, 7).into();

        let first = state.acquire_slot(ip).unwrap();
        let second = Arc::new(state.acquire_slot(ip).unwrap());
        let shared = second.clone();
        assert_eq!(first.ip(), ip);
        assert_eq!(state.ip_connection_count(&ip), 2);

        drop(first);
        assert_eq!(state.ws_connection_count(), 1);

        drop(second);
        assert_eq!(state.ws_connection_count(), 1);
        drop(shared);
        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);
    }

    #[test]
    fn test_state_from_config() {
        let mut config = config();
        config.azure_openai_endpoint = Some("https://myres.openai.azure.com".to_string());
        config.azure_openai_deployment = Some("rt".to_string());
        config.azure_openai_api_key = Some("key".to_string());
        config.policy.voice = Some("sage".to_string());
        config.tool_timeout_seconds = 0;

        let state = AppState::new(config).unwrap();
        assert!(state.upstream.is_some());
        assert!(state.tools.is_empty());
        assert_eq!(state.policy.snapshot().voice, Some(RealtimeVoice::Sage));
        assert_eq!(state.policy.original().temperature, Some(0.8));
    }

    #[test]
    fn test_state_without_endpoint_has_no_upstream() {
        let state = AppState::new(config()).unwrap();
        assert!(state.upstream.is_none());
    }
}
