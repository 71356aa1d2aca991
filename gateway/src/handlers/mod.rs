//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `events` - Admin access to the relay event log
//! - `policy` - Admin access to the session policy
//! - `realtime` - Realtime relay WebSocket

pub mod api;
pub mod events;
pub mod policy;
pub mod realtime;

// Re-export commonly used handlers for convenient access
pub use realtime::realtime_handler;
