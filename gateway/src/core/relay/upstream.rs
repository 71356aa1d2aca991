//! Upstream realtime connection.
//!
//! One connection is opened per client session. Failures are reported to the
//! caller and never retried: the session ends and the client reconnects.

use std::sync::Arc;

use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use zeroize::Zeroizing;

use super::credentials::TokenProvider;
use super::error::{RelayError, RelayResult};
use super::session::Frame;

/// Default realtime API version.
pub const DEFAULT_API_VERSION: &str = "2024-10-01-preview";

/// Header carrying the client's correlation id.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

/// Upstream socket type.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How the relay authenticates to the upstream endpoint.
#[derive(Clone)]
pub enum UpstreamAuth {
    /// Static key sent in the `api-key` header.
    ApiKey(Zeroizing<String>),
    /// Bearer token from a provider.
    Bearer(Arc<dyn TokenProvider>),
}

impl std::fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey([REDACTED])"),
            Self::Bearer(_) => f.write_str("Bearer(<provider>)"),
        }
    }
}

/// Upstream endpoint coordinates.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
}

impl UpstreamConfig {
    pub fn new(endpoint: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            deployment: deployment.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }
}

/// Opens authenticated upstream connections.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    config: UpstreamConfig,
    auth: UpstreamAuth,
    url: Url,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig, auth: UpstreamAuth) -> RelayResult<Self> {
        let url = realtime_url(&config)?;
        Ok(Self { config, auth, url })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// WebSocket URL of the realtime endpoint.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Build the handshake request with authentication headers.
    pub async fn build_request(&self, client_request_id: Option<&str>) -> RelayResult<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::InvalidConfiguration(e.to_string()))?;
        let headers = request.headers_mut();

        match &self.auth {
            UpstreamAuth::ApiKey(key) => {
                headers.insert("api-key", header_value(key.as_str())?);
            }
            UpstreamAuth::Bearer(provider) => {
                let token = Zeroizing::new(provider.token().await?);
                headers.insert(
                    http::header::AUTHORIZATION,
                    header_value(&format!("Bearer {}", token.as_str()))?,
                );
            }
        }

        if let Some(id) = client_request_id {
            match HeaderValue::from_str(id) {
                Ok(value) => {
                    headers.insert(CLIENT_REQUEST_ID_HEADER, value);
                }
                Err(_) => tracing::warn!("Ignoring malformed client request id header"),
            }
        }

        Ok(request)
    }

    /// Open the upstream socket.
    pub async fn connect(&self, client_request_id: Option<&str>) -> RelayResult<UpstreamStream> {
        let request = self.build_request(client_request_id).await?;

        tracing::debug!(
            deployment = %self.config.deployment,
            api_version = %self.config.api_version,
            "Connecting to realtime endpoint"
        );

        let (stream, _response) = connect_async(request).await.map_err(map_connect_error)?;

        tracing::info!(deployment = %self.config.deployment, "Connected to realtime endpoint");
        Ok(stream)
    }
}

/// Split an upstream socket into the frame sink and stream a session runs on.
/// Ping and pong are answered by tungstenite and never surface as frames.
pub fn into_frames(
    stream: UpstreamStream,
) -> (
    impl Sink<Frame, Error = RelayError> + Send + Unpin + 'static,
    impl Stream<Item = RelayResult<Frame>> + Send + Unpin + 'static,
) {
    let (sink, stream) = stream.split();

    let sink = sink
        .sink_map_err(|e| RelayError::WebSocketError(e.to_string()))
        .with(|frame: Frame| {
            future::ready(Ok::<_, RelayError>(match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(_) => Message::Binary(Default::default()),
                Frame::Close => Message::Close(None),
            }))
        });

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
            Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data.len()))),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
            Err(e) => Some(Err(RelayError::WebSocketError(e.to_string()))),
        })
    });

    (sink, stream)
}

fn header_value(value: &str) -> RelayResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        RelayError::InvalidConfiguration("credential contains invalid header characters".into())
    })
}

fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> RelayError {
    use tokio_tungstenite::tungstenite::Error;

    match err {
        Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            RelayError::AuthenticationFailed(format!(
                "realtime endpoint rejected credentials ({})",
                response.status()
            ))
        }
        Error::Http(response) => RelayError::ConnectionFailed(format!(
            "realtime endpoint returned {}",
            response.status()
        )),
        other => RelayError::ConnectionFailed(other.to_string()),
    }
}

/// `{endpoint}/openai/realtime?api-version=..&deployment=..` with the scheme
/// mapped to its WebSocket counterpart.
fn realtime_url(config: &UpstreamConfig) -> RelayResult<Url> {
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| RelayError::InvalidConfiguration(format!("invalid endpoint: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RelayError::InvalidConfiguration(format!(
                "unsupported endpoint scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::InvalidConfiguration("cannot set endpoint scheme".into()))?;

    let path = format!("{}/openai/realtime", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("api-version", &config.api_version)
        .append_pair("deployment", &config.deployment);

    Ok(url)
}
