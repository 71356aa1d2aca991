//! Realtime relay WebSocket endpoint
//!
//! Clients speak the realtime protocol directly: JSON text frames, one event
//! per frame. Each connection gets its own upstream connection; the relay
//! rewrites `session.update`, executes tool calls on the server and forwards
//! everything else untouched.
//!
//! ## Client → Server
//!
//! - Any realtime client event. `session.update` has the session policy and
//!   the server's tool list applied before it is forwarded.
//! - Binary frames are rejected (logged and skipped).
//!
//! ## Server → Client
//!
//! - Realtime server events, with function-call items removed.
//! - `extension.middle_tier_tool_response` carrying client-directed tool results.
//! - A close frame with code 1011 when the upstream connection cannot be opened.

mod handler;

pub use handler::realtime_handler;
