//! Realtime relay core.
//!
//! The relay sits between a voice client and the realtime model endpoint. It
//! forwards the protocol in both directions, executes the model's tool calls
//! on the server, and forces the server's session policy onto every session
//! configuration the client sends.
//!
//! # Architecture
//!
//! - [`ToolRegistry`] - name → schema + async handler, frozen at startup
//! - [`SessionPolicy`] - shared, admin-mutable configuration overrides
//! - [`UpstreamConnector`] - authenticated connection per session
//! - [`ToolCallCoordinator`] - per-session pending calls
//! - [`MessageTransformer`] - per-direction translation
//! - [`RelaySession`] - the two pumps and their writer tasks
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use realtime_relay::core::relay::*;
//! use realtime_relay::core::events::TracingEventSink;
//!
//! let transformer = MessageTransformer::new(
//!     Arc::new(ToolRegistry::new()),
//!     Arc::new(SessionPolicy::default()),
//!     Arc::new(TracingEventSink),
//! );
//! let upstream = connector.connect(None).await?;
//! let (upstream_out, upstream_in) = into_frames(upstream);
//! RelaySession::new("session-1", transformer)
//!     .run(client_in, client_out, upstream_in, upstream_out)
//!     .await;
//! ```

mod coordinator;
mod credentials;
mod error;
mod messages;
mod policy;
mod registry;
mod session;
mod transformer;
mod upstream;
mod voice;

pub use coordinator::{CallId, PendingToolCall, ToolCallCoordinator};
pub use credentials::{
    AccessToken, COGNITIVE_SERVICES_SCOPE, CachedTokenProvider, ClientSecretCredential,
    DEFAULT_AUTHORITY_HOST, DEFAULT_REFRESH_MARGIN, StaticTokenProvider, TokenCredential,
    TokenProvider,
};
pub use error::{RelayError, RelayResult, ToolError};
pub use messages::{
    ClientEventKind, Envelope, FunctionCallItem, ItemKind, RelayClientEvent, RelayUpstreamEvent,
    ServerEventKind, peek_tag,
};
pub use policy::{PolicyError, PolicyField, PolicySettings, PolicyUpdate, SessionPolicy};
pub use registry::{
    Tool, ToolContext, ToolFailureKind, ToolFuture, ToolHandler, ToolPayload, ToolRegistry,
    ToolResult, ToolResultDirection,
};
pub use session::{Frame, RelaySession, SessionEnd};
pub use transformer::{DEFAULT_TOOL_TIMEOUT, Dispatch, MessageTransformer};
pub use upstream::{
    CLIENT_REQUEST_ID_HEADER, DEFAULT_API_VERSION, UpstreamAuth, UpstreamConfig,
    UpstreamConnector, UpstreamStream, into_frames,
};
pub use voice::{
    INPUT_TRANSCRIPTION_LANGUAGE, INPUT_TRANSCRIPTION_MODEL, MODALITIES, OUTPUT_AUDIO_FORMAT,
    RealtimeVoice, VAD_PREFIX_PADDING_MS, VAD_SILENCE_DURATION_MS, VAD_THRESHOLD,
};
