//! Realtime WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::realtime::realtime_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the Realtime WebSocket router
///
/// # Endpoint
///
/// `GET /realtime` - WebSocket upgrade; the connection is relayed to the
/// configured realtime endpoint.
///
/// # Protocol
///
/// Text frames carry realtime protocol events in both directions.
/// `session.update` from the client is rewritten with the session policy and
/// the server's tools; tool calls from the model are executed by the relay
/// and never reach the client. Tool results meant for the client arrive as
/// `extension.middle_tier_tool_response` events.
///
/// # Example
///
/// ```json
/// // Client sends
/// {"type": "session.update", "session": {"turn_detection": {"type": "server_vad"}}}
///
/// // Server sends, after a grounding tool call
/// {"type": "extension.middle_tier_tool_response", "previous_item_id": "item_1",
///  "tool_name": "report_grounding", "tool_result": "{\"sources\":[...]}"}
/// ```
pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(realtime_handler))
        .layer(TraceLayer::new_for_http())
}
