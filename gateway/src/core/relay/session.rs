//! One relayed session: two pumps and two writer tasks.
//!
//! ```text
//!  client ──► [client pump] ──► upstream writer ──► upstream
//!  client ◄── client writer ◄── [upstream pump] ◄── upstream
//!                                     │
//!                                     └──► upstream writer (tool outputs, response.create)
//! ```
//!
//! Sockets are abstracted as streams of [`Frame`] and sinks of [`Frame`] so
//! the session does not care which WebSocket library sits on either side.
//! When either pump ends the session token is cancelled, the other pump stops
//! at its next await point, and the writers flush what is queued, send a
//! close frame and exit.

use std::fmt;

use futures::future::{self, Either};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::coordinator::ToolCallCoordinator;
use super::error::{RelayError, RelayResult};
use super::transformer::{Dispatch, MessageTransformer};
use crate::core::events::{EventKind, RelayEvent};

/// Queue depth of each writer task.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Binary payload; only its length is kept since the relay never
    /// forwards binary data.
    Binary(usize),
    Close,
}

/// Route for a writer task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    UpstreamClosed,
    Cancelled,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientClosed => "client closed",
            Self::UpstreamClosed => "upstream closed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// A client paired with one upstream connection.
pub struct RelaySession {
    id: String,
    transformer: MessageTransformer,
    cancel: CancellationToken,
}

impl RelaySession {
    pub fn new(id: impl Into<String>, transformer: MessageTransformer) -> Self {
        Self {
            id: id.into(),
            transformer,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that ends the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Relay until either side closes. Returns the side that ended first.
    pub async fn run<CI, CO, UI, UO>(
        self,
        client_in: CI,
        client_out: CO,
        upstream_in: UI,
        upstream_out: UO,
    ) -> SessionEnd
    where
        CI: Stream<Item = RelayResult<Frame>> + Send + Unpin + 'static,
        CO: Sink<Frame, Error = RelayError> + Send + Unpin + 'static,
        UI: Stream<Item = RelayResult<Frame>> + Send + Unpin + 'static,
        UO: Sink<Frame, Error = RelayError> + Send + Unpin + 'static,
    {
        let (client_tx, client_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
        let (upstream_tx, upstream_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);

        let client_writer = tokio::spawn(write_frames(
            client_rx,
            client_out,
            self.cancel.clone(),
            self.id.clone(),
            "client",
        ));
        let upstream_writer = tokio::spawn(write_frames(
            upstream_rx,
            upstream_out,
            self.cancel.clone(),
            self.id.clone(),
            "upstream",
        ));

        let client_pump = tokio::spawn(client_to_upstream(
            client_in,
            upstream_tx.clone(),
            self.transformer.clone(),
            self.cancel.clone(),
            self.id.clone(),
        ));
        let upstream_pump = tokio::spawn(upstream_to_client(
            upstream_in,
            client_tx,
            upstream_tx,
            self.transformer.clone(),
            self.cancel.clone(),
            self.id.clone(),
        ));

        let (first, other) = match future::select(client_pump, upstream_pump).await {
            Either::Left((end, other)) | Either::Right((end, other)) => (end, other),
        };
        self.cancel.cancel();

        let end = first.unwrap_or_else(|e| {
            tracing::error!(session_id = %self.id, "Pump task failed: {}", e);
            SessionEnd::Cancelled
        });
        if let Err(e) = other.await {
            tracing::error!(session_id = %self.id, "Pump task failed: {}", e);
        }
        let _ = client_writer.await;
        let _ = upstream_writer.await;

        tracing::info!(session_id = %self.id, reason = %end, "Relay session ended");
        end
    }
}

async fn client_to_upstream<CI>(
    mut client_in: CI,
    upstream_tx: mpsc::Sender<Outbound>,
    transformer: MessageTransformer,
    cancel: CancellationToken,
    session_id: String,
) -> SessionEnd
where
    CI: Stream<Item = RelayResult<Frame>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            frame = client_in.next() => frame,
        };

        let text = match frame {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(len))) => {
                reject_binary(&transformer, &session_id, "client", len);
                continue;
            }
            Some(Ok(Frame::Close)) | None => {
                tracing::debug!(session_id = %session_id, "Client closed the connection");
                let _ = upstream_tx.send(Outbound::Close).await;
                return SessionEnd::ClientClosed;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = %session_id, "Client connection lost: {}", e);
                return SessionEnd::ClientClosed;
            }
        };

        match transformer.to_upstream(&text, &session_id) {
            Ok(out) => {
                if upstream_tx.send(Outbound::Text(out)).await.is_err() {
                    return SessionEnd::UpstreamClosed;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Skipping malformed client frame: {}", e);
            }
        }
    }
}

async fn upstream_to_client<UI>(
    mut upstream_in: UI,
    client_tx: mpsc::Sender<Outbound>,
    upstream_tx: mpsc::Sender<Outbound>,
    transformer: MessageTransformer,
    cancel: CancellationToken,
    session_id: String,
) -> SessionEnd
where
    UI: Stream<Item = RelayResult<Frame>> + Unpin,
{
    let mut coordinator = ToolCallCoordinator::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            frame = upstream_in.next() => frame,
        };

        let text = match frame {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(len))) => {
                reject_binary(&transformer, &session_id, "upstream", len);
                continue;
            }
            Some(Ok(Frame::Close)) | None => {
                tracing::debug!(session_id = %session_id, "Upstream closed the connection");
                let _ = client_tx.send(Outbound::Close).await;
                return SessionEnd::UpstreamClosed;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = %session_id, "Upstream connection lost: {}", e);
                let _ = client_tx.send(Outbound::Close).await;
                return SessionEnd::UpstreamClosed;
            }
        };

        let translated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            translated = transformer.to_client(&text, &mut coordinator, &session_id) => translated,
        };

        let dispatches = match translated {
            Ok(dispatches) => dispatches,
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Skipping malformed upstream frame: {}", e);
                continue;
            }
        };

        for dispatch in dispatches {
            match dispatch {
                Dispatch::Upstream(text) => {
                    if upstream_tx.send(Outbound::Text(text)).await.is_err() {
                        return SessionEnd::UpstreamClosed;
                    }
                }
                Dispatch::Client(text) => {
                    if client_tx.send(Outbound::Text(text)).await.is_err() {
                        return SessionEnd::ClientClosed;
                    }
                }
            }
        }
    }
}

fn reject_binary(transformer: &MessageTransformer, session_id: &str, peer: &str, len: usize) {
    tracing::warn!(session_id = %session_id, peer, len, "Skipping binary frame");
    transformer.events().emit(
        RelayEvent::new(EventKind::Error, format!("Binary frame from {peer} rejected"))
            .with_session(session_id)
            .with_data(json!({ "peer": peer, "length": len })),
    );
}

/// Writer task: drains the queue into the sink until every sender is gone or
/// a close is routed, then closes the socket.
async fn write_frames<S>(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: S,
    cancel: CancellationToken,
    session_id: String,
    peer: &'static str,
) where
    S: Sink<Frame, Error = RelayError> + Unpin,
{
    while let Some(route) = rx.recv().await {
        let frame = match route {
            Outbound::Text(text) => Frame::Text(text),
            Outbound::Close => break,
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(session_id = %session_id, peer, "Failed to send frame: {}", e);
            cancel.cancel();
            return;
        }
    }

    let _ = sink.send(Frame::Close).await;
    let _ = sink.close().await;
    tracing::debug!(session_id = %session_id, peer, "Writer closed");
}
