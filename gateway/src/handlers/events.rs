//! Admin access to the relay event log: query, clear, totals and a live
//! WebSocket feed.

use axum::{
    Json,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::core::events::{
    EventKind, EventLog, EventQuery, EventStats, EventSubscription, RelayEvent,
};
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Query string of `GET /admin/events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    /// Comma-separated event kinds
    pub kinds: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl EventsParams {
    fn to_query(&self) -> AppResult<EventQuery> {
        let kinds = match self.kinds.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(list) => Some(
                list.split(',')
                    .map(str::trim)
                    .filter(|kind| !kind.is_empty())
                    .map(|kind| kind.parse::<EventKind>().map_err(AppError::BadRequest))
                    .collect::<AppResult<Vec<_>>>()?,
            ),
        };
        Ok(EventQuery {
            kinds,
            session_id: self.session_id.clone(),
            limit: self.limit,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<RelayEvent>,
    pub count: usize,
    pub capacity: usize,
}

/// `GET /admin/events` - recent events, oldest first.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> AppResult<Json<EventsResponse>> {
    let query = params.to_query()?;
    let events = state.event_log.query(&query);
    Ok(Json(EventsResponse {
        count: events.len(),
        capacity: state.event_log.capacity(),
        events,
    }))
}

/// `DELETE /admin/events`
pub async fn clear_events(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cleared = state.event_log.clear();
    tracing::info!(cleared, "Event log cleared");
    Json(json!({ "cleared": cleared }))
}

/// `GET /admin/events/stats`
pub async fn event_stats(State(state): State<Arc<AppState>>) -> Json<EventStats> {
    Json(state.event_log.stats())
}

/// `GET /admin/events/stream` - live event feed.
///
/// The client first receives the most recent events, then each new one as
/// `{"type": "event", "event": {...}}`. A `ping` (plain or
/// `{"type": "ping"}`) is answered with `{"type": "pong"}`.
pub async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let log = state.event_log.clone();
    ws.on_upgrade(move |socket| follow_events(socket, log))
}

async fn follow_events(socket: WebSocket, log: Arc<EventLog>) {
    let EventSubscription {
        recent,
        mut receiver,
    } = log.subscribe();
    let (mut sender, mut incoming) = socket.split();
    info!(
        subscribers = log.subscriber_count(),
        "Event stream client connected"
    );

    let mut open = true;
    for event in &recent {
        if send_json(&mut sender, event_frame(event)).await.is_err() {
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => open = send_json(&mut sender, event_frame(&event)).await.is_ok(),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream client fell behind");
                }
                Err(RecvError::Closed) => open = false,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) if is_ping(text.as_str()) => {
                    open = send_json(&mut sender, json!({ "type": "pong" })).await.is_ok();
                }
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Event stream client error");
                    open = false;
                }
            },
        }
    }

    drop(receiver);
    info!(
        subscribers = log.subscriber_count(),
        "Event stream client disconnected"
    );
}

fn event_frame(event: &RelayEvent) -> Value {
    json!({ "type": "event", "event": event })
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    value: Value,
) -> Result<(), axum::Error> {
    sender.send(Message::Text(value.to_string().into())).await
}

fn is_ping(text: &str) -> bool {
    let text = text.trim();
    text.eq_ignore_ascii_case("ping")
        || serde_json::from_str::<Value>(text)
            .is_ok_and(|value| value.get("type").and_then(Value::as_str) == Some("ping"))
}
