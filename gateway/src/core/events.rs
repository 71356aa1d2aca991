//! Structured relay lifecycle events.
//!
//! Events are fire-and-forget: emitting never blocks a pump and never fails.
//! The in-memory [`EventLog`] backs the admin events endpoints and fans every
//! event out to live subscribers; the other sinks only log.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;

/// Default number of events kept by [`EventLog`].
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1000;

/// Events a new subscriber is replayed before it follows the live stream.
pub const SUBSCRIBE_REPLAY: usize = 50;

/// Events buffered per subscriber; a slower subscriber skips ahead.
const STREAM_BUFFER: usize = 256;

/// Kinds of events the relay emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WebsocketConnect,
    WebsocketDisconnect,
    RealtimeApiReceived,
    UserQuestion,
    AiResponseStart,
    AiResponseComplete,
    UpstreamConnect,
    ToolCallStart,
    ToolCallComplete,
    SearchQuery,
    GroundingSources,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebsocketConnect => "websocket_connect",
            Self::WebsocketDisconnect => "websocket_disconnect",
            Self::RealtimeApiReceived => "realtime_api_received",
            Self::UserQuestion => "user_question",
            Self::AiResponseStart => "ai_response_start",
            Self::AiResponseComplete => "ai_response_complete",
            Self::UpstreamConnect => "upstream_connect",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolCallComplete => "tool_call_complete",
            Self::SearchQuery => "search_query",
            Self::GroundingSources => "grounding_sources",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "websocket_connect" => Ok(Self::WebsocketConnect),
            "websocket_disconnect" => Ok(Self::WebsocketDisconnect),
            "realtime_api_received" => Ok(Self::RealtimeApiReceived),
            "user_question" => Ok(Self::UserQuestion),
            "ai_response_start" => Ok(Self::AiResponseStart),
            "ai_response_complete" => Ok(Self::AiResponseComplete),
            "upstream_connect" => Ok(Self::UpstreamConnect),
            "tool_call_start" => Ok(Self::ToolCallStart),
            "tool_call_complete" => Ok(Self::ToolCallComplete),
            "search_query" => Ok(Self::SearchQuery),
            "grounding_sources" => Ok(Self::GroundingSources),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One structured event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayEvent {
    pub id: String,
    pub timestamp: String,
    pub kind: EventKind,
    pub message: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl RelayEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            kind,
            message: message.into(),
            data: Value::Null,
            session_id: None,
            duration_ms: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Receiver of relay events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RelayEvent);
}

fn trace_event(event: &RelayEvent) {
    let session_id = event.session_id.as_deref().unwrap_or("-");
    match event.kind {
        EventKind::Error => tracing::warn!(
            kind = %event.kind,
            session_id = %session_id,
            data = %event.data,
            "{}",
            event.message
        ),
        _ => tracing::debug!(
            kind = %event.kind,
            session_id = %session_id,
            duration_ms = ?event.duration_ms,
            "{}",
            event.message
        ),
    }
}

/// Logs events through `tracing` and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: RelayEvent) {
        trace_event(&event);
    }
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: RelayEvent) {}
}

/// Filter for [`EventLog::query`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub kinds: Option<Vec<EventKind>>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl EventQuery {
    fn matches(&self, event: &RelayEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        match &self.session_id {
            Some(id) => event.session_id.as_deref() == Some(id.as_str()),
            None => true,
        }
    }
}

/// Bounded in-memory ring of recent events. Oldest events are dropped first.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<RelayEvent>>,
    stream: broadcast::Sender<RelayEvent>,
}

/// A live view of the log: the most recent events at subscription time,
/// then every event emitted afterwards.
pub struct EventSubscription {
    pub recent: Vec<RelayEvent>,
    pub receiver: broadcast::Receiver<RelayEvent>,
}

/// Totals for `GET /admin/events/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub total_events: usize,
    pub connected_clients: usize,
    pub event_counts: BTreeMap<String, usize>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (stream, _) = broadcast::channel(STREAM_BUFFER);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            stream,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Matching events, oldest first. With a limit, only the most recent
    /// `limit` matches are returned.
    pub fn query(&self, query: &EventQuery) -> Vec<RelayEvent> {
        let events = self.events.lock();
        let mut matched: Vec<RelayEvent> = events
            .iter()
            .rev()
            .filter(|event| query.matches(event))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Follow the log. The replay and the receiver are taken under the same
    /// lock as emission, so no event is missed or seen twice.
    pub fn subscribe(&self) -> EventSubscription {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(SUBSCRIBE_REPLAY);
        EventSubscription {
            recent: events.iter().skip(skip).cloned().collect(),
            receiver: self.stream.subscribe(),
        }
    }

    /// Live subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.stream.receiver_count()
    }

    pub fn stats(&self) -> EventStats {
        let events = self.events.lock();
        let mut event_counts = BTreeMap::new();
        for event in events.iter() {
            *event_counts.entry(event.kind.to_string()).or_insert(0) += 1;
        }
        EventStats {
            total_events: events.len(),
            connected_clients: self.subscriber_count(),
            event_counts,
        }
    }

    /// Remove every event, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let dropped = events.len();
        events.clear();
        dropped
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: RelayEvent) {
        trace_event(&event);
        let mut events = self.events.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        // No subscribers is the common case, not an error.
        let _ = self.stream.send(event.clone());
        events.push_back(event);
    }
}
