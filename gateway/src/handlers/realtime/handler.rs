//! Realtime WebSocket handler
//!
//! Upgrades the client connection, opens the upstream connection and runs a
//! [`RelaySession`] between the two until either side goes away.

use axum::{
    Extension,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::events::{EventKind, RelayEvent};
use crate::core::relay::{
    CLIENT_REQUEST_ID_HEADER, Frame, RelayError, RelayResult, RelaySession, into_frames,
};
use crate::state::{AppState, ConnectionSlot};

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Realtime WebSocket handler
///
/// Upgrades the HTTP connection to WebSocket and relays it to the realtime
/// endpoint. The client's `x-ms-client-request-id` header, when present, is
/// forwarded on the upstream handshake.
///
/// # Arguments
/// * `ws` - The WebSocket upgrade request from Axum
/// * `state` - Application state
/// * `slot` - Slot taken by the connection limit middleware, if applied. It is
///   moved into the upgrade callback and released when the session ends or the
///   upgrade fails.
/// * `headers` - Request headers
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    slot: Option<Extension<Arc<ConnectionSlot>>>,
    headers: HeaderMap,
) -> Response {
    let request_id = headers
        .get(CLIENT_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let slot = slot.map(|Extension(slot)| slot);

    info!(
        client_request_id = ?request_id,
        "Realtime WebSocket connection upgrade requested"
    );

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_realtime_socket(socket, state, request_id, slot))
}

/// Handle one relayed connection from upgrade to disconnect.
async fn handle_realtime_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    request_id: Option<String>,
    slot: Option<Arc<ConnectionSlot>>,
) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let events = state.events();

    info!(session_id = %session_id, "Realtime WebSocket connection established");
    events.emit(
        RelayEvent::new(EventKind::WebsocketConnect, "Client connected")
            .with_session(&session_id)
            .with_data(json!({ "client_request_id": request_id })),
    );

    let reason = relay(socket, &state, &session_id, request_id.as_deref()).await;

    events.emit(
        RelayEvent::new(EventKind::WebsocketDisconnect, "Client disconnected")
            .with_session(&session_id)
            .with_data(json!({ "reason": reason })),
    );

    drop(slot);
    info!(session_id = %session_id, reason = %reason, "Realtime WebSocket connection closed");
}

/// Connect upstream and run the session. Returns the reason the session ended.
async fn relay(
    mut socket: WebSocket,
    state: &AppState,
    session_id: &str,
    request_id: Option<&str>,
) -> String {
    let events = state.events();

    let Some(connector) = &state.upstream else {
        let message = "No realtime endpoint configured";
        warn!(session_id = %session_id, "{}", message);
        events.emit(
            RelayEvent::new(EventKind::Error, message)
                .with_session(session_id)
                .with_data(json!({ "stage": "upstream_connect" })),
        );
        close_with_error(&mut socket, message).await;
        return "upstream unavailable".to_string();
    };

    let upstream = match connector.connect(request_id).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Upstream connection failed");
            events.emit(
                RelayEvent::new(EventKind::Error, format!("Upstream connection failed: {e}"))
                    .with_session(session_id)
                    .with_data(json!({
                        "stage": "upstream_connect",
                        "authentication": matches!(e, RelayError::AuthenticationFailed(_)),
                    })),
            );
            close_with_error(&mut socket, "Upstream connection failed").await;
            return "upstream connection failed".to_string();
        }
    };

    events.emit(
        RelayEvent::new(EventKind::UpstreamConnect, "Connected to realtime endpoint")
            .with_session(session_id)
            .with_data(json!({ "deployment": connector.config().deployment })),
    );

    let (upstream_out, upstream_in) = into_frames(upstream);
    let (client_out, client_in) = client_frames(socket);

    RelaySession::new(session_id, state.transformer())
        .run(client_in, client_out, upstream_in, upstream_out)
        .await
        .to_string()
}

async fn close_with_error(socket: &mut WebSocket, reason: &str) {
    let frame = CloseFrame {
        code: close_code::ERROR,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

/// Split the client socket into the frame sink and stream a session runs on.
fn client_frames(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = RelayError> + Send + Unpin + 'static,
    impl Stream<Item = RelayResult<Frame>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();

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
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => Some(Err(RelayError::WebSocketError(e.to_string()))),
        })
    });

    (sink, stream)
}
