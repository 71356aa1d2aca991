//! Bearer token providers for upstream authentication.
//!
//! [`CachedTokenProvider`] wraps any [`TokenCredential`] and refreshes the
//! token once it is within the configured margin of expiry.
//! [`ClientSecretCredential`] performs the OAuth2 client-credentials grant
//! against the Microsoft identity platform.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use super::error::{RelayError, RelayResult};

/// Scope requested for Azure OpenAI tokens.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// Default identity platform authority.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Default refresh margin before token expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Longest lifetime trusted from a token response.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// An access token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: Zeroizing<String>,
    pub expires_at: Instant,
}

impl AccessToken {
    /// `expires_in` is capped at [`MAX_TOKEN_LIFETIME`].
    pub fn new(token: impl Into<String>, expires_in: Duration) -> Self {
        let now = Instant::now();
        Self {
            token: Zeroizing::new(token.into()),
            expires_at: now
                .checked_add(expires_in.min(MAX_TOKEN_LIFETIME))
                .unwrap_or(now),
        }
    }

    /// Whether the token expires within `margin` of now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at
            .checked_duration_since(Instant::now())
            .is_none_or(|remaining| remaining <= margin)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of fresh tokens. Implementations do no caching.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self) -> RelayResult<AccessToken>;
}

/// Bearer tokens for the upstream connection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> RelayResult<String>;
}

/// A fixed token, for pre-issued tokens and tests.
pub struct StaticTokenProvider {
    token: Zeroizing<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> RelayResult<String> {
        Ok(self.token.to_string())
    }
}

/// Caches a credential's token and refreshes it near expiry.
pub struct CachedTokenProvider {
    credential: Arc<dyn TokenCredential>,
    refresh_margin: Duration,
    cached: Mutex<Option<AccessToken>>,
}

impl CachedTokenProvider {
    pub fn new(credential: Arc<dyn TokenCredential>, refresh_margin: Duration) -> Self {
        Self {
            credential,
            refresh_margin,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for CachedTokenProvider {
    async fn token(&self) -> RelayResult<String> {
        // Held across the fetch so concurrent sessions share one refresh.
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.expires_within(self.refresh_margin) {
                return Ok(token.token.to_string());
            }
            tracing::debug!("Access token near expiry, refreshing");
        }

        let fresh = self.credential.get_token().await?;
        let token = fresh.token.to_string();
        *cached = Some(fresh);
        Ok(token)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth2 client-credentials grant for a service principal.
pub struct ClientSecretCredential {
    client: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    scope: String,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
            scope: COGNITIVE_SERVICES_SCOPE.to_string(),
        }
    }

    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        )
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self) -> RelayResult<AccessToken> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(self.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| RelayError::AuthenticationFailed(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(description) => format!("{}: {}", e.error, description),
                    None => e.error,
                })
                .unwrap_or(body);
            return Err(RelayError::AuthenticationFailed(format!(
                "token endpoint returned {status}: {detail}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            RelayError::AuthenticationFailed(format!("invalid token response: {e}"))
        })?;

        tracing::info!(
            tenant_id = %self.tenant_id,
            expires_in = token.expires_in,
            "Acquired access token"
        );
        Ok(AccessToken::new(
            token.access_token,
            Duration::from_secs(token.expires_in),
        ))
    }
}
