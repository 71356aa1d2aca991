pub mod events;
pub mod relay;

// Re-export commonly used types for convenience
pub use events::{
    EventKind, EventLog, EventQuery, EventSink, EventStats, EventSubscription, NoopEventSink,
    RelayEvent, TracingEventSink,
};

pub use relay::{
    MessageTransformer, PolicySettings, RelayError, RelayResult, RelaySession, SessionPolicy,
    ToolRegistry, ToolResult, ToolResultDirection, UpstreamConnector,
};
