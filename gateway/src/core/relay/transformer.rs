//! Per-direction message translation.
//!
//! The transformer is the only place the relay looks inside frames. It owns
//! no per-session state: the coordinator is passed in by the upstream→client
//! pump that owns it, and the policy is read as a snapshot per translation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};

use super::coordinator::{CallId, ToolCallCoordinator};
use super::error::{RelayError, RelayResult, ToolError};
use super::messages::{
    ClientEventKind, Envelope, FunctionCallItem, ItemKind, RelayClientEvent, RelayUpstreamEvent,
    ServerEventKind, peek_tag,
};
use super::policy::{PolicySettings, SessionPolicy};
use super::registry::{Tool, ToolContext, ToolRegistry, ToolResult, ToolResultDirection};
use super::voice::{
    INPUT_TRANSCRIPTION_LANGUAGE, INPUT_TRANSCRIPTION_MODEL, MODALITIES, OUTPUT_AUDIO_FORMAT,
    VAD_PREFIX_PADDING_MS, VAD_SILENCE_DURATION_MS, VAD_THRESHOLD,
};
use crate::core::events::{EventKind, EventSink, RelayEvent};

/// Default bound on a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A frame to deliver, in order, as a result of translating one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Upstream(String),
    Client(String),
}

/// Stateless translator shared by both pumps of a session.
#[derive(Clone)]
pub struct MessageTransformer {
    registry: Arc<ToolRegistry>,
    policy: Arc<SessionPolicy>,
    events: Arc<dyn EventSink>,
    tool_timeout: Option<Duration>,
}

impl MessageTransformer {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<SessionPolicy>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            policy,
            events,
            tool_timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    /// Bound each tool invocation. `None` lets handlers run unbounded.
    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<SessionPolicy> {
        &self.policy
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    // =========================================================================
    // Client → Upstream
    // =========================================================================

    /// Translate one client frame. Everything except `session.update` is
    /// returned byte-for-byte. Every frame is reported as a
    /// `realtime_api_received` event carrying its type tag only.
    pub fn to_upstream(&self, text: &str, session_id: &str) -> RelayResult<String> {
        let tag = peek_tag(text)?;
        self.emit(
            RelayEvent::new(
                EventKind::RealtimeApiReceived,
                format!("Received from client: {tag}"),
            )
            .with_session(session_id)
            .with_data(json!({ "message_type": tag, "size": text.len() })),
        );
        match ClientEventKind::from_tag(&tag) {
            ClientEventKind::SessionUpdate => {
                let envelope = Envelope::parse(text)?;
                self.rewrite_session_update(envelope)
            }
            ClientEventKind::Other => Ok(text.to_string()),
        }
    }

    fn rewrite_session_update(&self, mut envelope: Envelope) -> RelayResult<String> {
        let policy = self.policy.snapshot();
        let session = session_object(&mut envelope)?;

        apply_policy(session, &policy);

        session.insert(
            "input_audio_transcription".to_string(),
            json!({
                "model": INPUT_TRANSCRIPTION_MODEL,
                "language": INPUT_TRANSCRIPTION_LANGUAGE,
            }),
        );
        session.insert("output_audio_format".to_string(), json!(OUTPUT_AUDIO_FORMAT));
        session.insert("modalities".to_string(), json!(MODALITIES));
        session.insert(
            "turn_detection".to_string(),
            json!({
                "type": "server_vad",
                "threshold": VAD_THRESHOLD,
                "prefix_padding_ms": VAD_PREFIX_PADDING_MS,
                "silence_duration_ms": VAD_SILENCE_DURATION_MS,
            }),
        );

        let tools = self.registry.schemas();
        let tool_choice = if tools.is_empty() { "none" } else { "auto" };
        session.insert("tools".to_string(), Value::Array(tools));
        session.insert("tool_choice".to_string(), json!(tool_choice));

        envelope.to_text()
    }

    // =========================================================================
    // Upstream → Client
    // =========================================================================

    /// Translate one upstream frame into the ordered frames to deliver.
    ///
    /// Tool handlers run inline here, so a slow tool holds back the rest of
    /// this session's upstream traffic until it completes or times out.
    pub async fn to_client(
        &self,
        text: &str,
        coordinator: &mut ToolCallCoordinator,
        session_id: &str,
    ) -> RelayResult<Vec<Dispatch>> {
        let tag = peek_tag(text)?;
        let kind = ServerEventKind::from_tag(&tag);

        if kind == ServerEventKind::Other {
            return Ok(vec![Dispatch::Client(text.to_string())]);
        }

        let mut envelope = Envelope::parse(text)?;
        let mut out = Vec::new();

        match kind {
            ServerEventKind::SessionCreated => {
                self.sanitize_session_created(&mut envelope)?;
                self.emit(
                    RelayEvent::new(EventKind::RealtimeApiReceived, "Realtime session created")
                        .with_session(session_id)
                        .with_data(json!({
                            "upstream_session_id": envelope
                                .body
                                .get("session")
                                .and_then(|s| s.get("id"))
                                .cloned()
                                .unwrap_or(Value::Null),
                        })),
                );
                out.push(Dispatch::Client(envelope.to_text()?));
            }
            ServerEventKind::OutputItemAdded => {
                if envelope.item_kind() != Some(ItemKind::FunctionCall) {
                    out.push(Dispatch::Client(text.to_string()));
                }
            }
            ServerEventKind::ConversationItemCreated => match envelope.item_kind() {
                Some(ItemKind::FunctionCall) => {
                    self.record_call(&envelope, coordinator, session_id);
                }
                Some(ItemKind::FunctionCallOutput) => {}
                _ => out.push(Dispatch::Client(text.to_string())),
            },
            ServerEventKind::FunctionCallArgumentsDelta
            | ServerEventKind::FunctionCallArgumentsDone => {}
            ServerEventKind::OutputItemDone => {
                match (envelope.item_kind(), envelope.item()) {
                    (Some(ItemKind::FunctionCall), Some(item)) => {
                        let call = FunctionCallItem::from_item(item)?;
                        self.execute_tool_call(call, coordinator, session_id, &mut out)
                            .await?;
                    }
                    _ => out.push(Dispatch::Client(text.to_string())),
                }
            }
            ServerEventKind::ResponseDone => {
                let calls = coordinator.finish_response();
                if calls > 0 {
                    tracing::debug!(
                        session_id = %session_id,
                        calls,
                        "Requesting continuation after tool calls"
                    );
                    out.push(Dispatch::Upstream(
                        RelayUpstreamEvent::ResponseCreate.to_text()?,
                    ));
                }

                self.emit(
                    RelayEvent::new(EventKind::AiResponseComplete, "AI response completed")
                        .with_session(session_id)
                        .with_data(response_summary(&envelope, calls)),
                );

                if strip_function_calls(&mut envelope) {
                    out.push(Dispatch::Client(envelope.to_text()?));
                } else {
                    out.push(Dispatch::Client(text.to_string()));
                }
            }
            ServerEventKind::ResponseCreated => {
                self.emit(
                    RelayEvent::new(EventKind::AiResponseStart, "AI response started")
                        .with_session(session_id)
                        .with_data(json!({
                            "response_id": envelope
                                .body
                                .get("response")
                                .and_then(|r| r.get("id"))
                                .cloned()
                                .unwrap_or(Value::Null),
                        })),
                );
                out.push(Dispatch::Client(text.to_string()));
            }
            ServerEventKind::InputTranscriptionCompleted => {
                let transcript = envelope.str_field("transcript").unwrap_or_default();
                self.emit(
                    RelayEvent::new(EventKind::UserQuestion, "User question transcribed")
                        .with_session(session_id)
                        .with_data(json!({ "transcript": transcript })),
                );
                out.push(Dispatch::Client(text.to_string()));
            }
            ServerEventKind::Error => {
                let error = envelope.body.get("error").cloned().unwrap_or(Value::Null);
                tracing::warn!(session_id = %session_id, error = %error, "Upstream reported an error");
                self.emit(
                    RelayEvent::new(EventKind::Error, "Upstream reported an error")
                        .with_session(session_id)
                        .with_data(error),
                );
                out.push(Dispatch::Client(text.to_string()));
            }
            ServerEventKind::Other => out.push(Dispatch::Client(text.to_string())),
        }

        Ok(out)
    }

    fn sanitize_session_created(&self, envelope: &mut Envelope) -> RelayResult<()> {
        let voice = self
            .policy
            .snapshot()
            .voice
            .map(|v| json!(v.as_str()))
            .unwrap_or(Value::Null);
        let session = session_object(envelope)?;
        session.insert("instructions".to_string(), json!(""));
        session.insert("tools".to_string(), json!([]));
        session.insert("voice".to_string(), voice);
        session.insert("tool_choice".to_string(), json!("none"));
        session.insert("max_response_output_tokens".to_string(), Value::Null);
        Ok(())
    }

    fn record_call(
        &self,
        envelope: &Envelope,
        coordinator: &mut ToolCallCoordinator,
        session_id: &str,
    ) {
        let call_id = envelope
            .item()
            .and_then(|item| item.get("call_id"))
            .and_then(Value::as_str);
        let Some(call_id) = call_id else {
            tracing::warn!(session_id = %session_id, "Function call item without call_id");
            return;
        };
        let previous_item_id = envelope.str_field("previous_item_id").map(str::to_string);
        if coordinator.open(CallId::new(call_id), previous_item_id) {
            tracing::debug!(session_id = %session_id, call_id = %call_id, "Function call announced");
        }
    }

    async fn execute_tool_call(
        &self,
        call: FunctionCallItem,
        coordinator: &mut ToolCallCoordinator,
        session_id: &str,
        out: &mut Vec<Dispatch>,
    ) -> RelayResult<()> {
        let call_id = CallId::new(call.call_id.as_str());

        let Some(pending) = coordinator.resolve(&call_id) else {
            let err = ToolError::UnknownCall(call_id.clone());
            self.report_tool_error(&err, &call.name, session_id);
            out.push(Dispatch::Upstream(
                RelayUpstreamEvent::function_call_output(call_id.as_str(), err.to_result().to_text())
                    .to_text()?,
            ));
            return Ok(());
        };

        self.emit(
            RelayEvent::new(EventKind::ToolCallStart, format!("Calling tool '{}'", call.name))
                .with_session(session_id)
                .with_data(json!({
                    "tool_name": call.name,
                    "call_id": call_id.as_str(),
                    "arguments": call.arguments,
                })),
        );

        let started = Instant::now();
        let outcome = match self.registry.get(&call.name) {
            Some(tool) => match parse_arguments(&call.arguments) {
                Ok(arguments) => {
                    let context = ToolContext::new(session_id, call_id.as_str());
                    self.invoke(tool, arguments, context).await
                }
                Err(err) => Err(err),
            },
            None => Err(ToolError::UnknownTool(call.name.clone())),
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (result, success) = match outcome {
            Ok(result) => (result, true),
            Err(err) => {
                self.report_tool_error(&err, &call.name, session_id);
                (err.to_result(), false)
            }
        };

        let text = result.to_text();
        match result.direction {
            ToolResultDirection::ToServer => {
                out.push(Dispatch::Upstream(
                    RelayUpstreamEvent::function_call_output(call_id.as_str(), text)
                        .to_text()?,
                ));
            }
            ToolResultDirection::ToClient => {
                out.push(Dispatch::Upstream(
                    RelayUpstreamEvent::function_call_output(call_id.as_str(), "").to_text()?,
                ));
                out.push(Dispatch::Client(
                    RelayClientEvent::ToolResponse {
                        previous_item_id: pending.previous_item_id,
                        tool_name: call.name.clone(),
                        tool_result: text,
                    }
                    .to_text()?,
                ));
            }
        }

        tracing::info!(
            session_id = %session_id,
            tool = %call.name,
            call_id = %call_id,
            success,
            duration_ms,
            "Tool call completed"
        );
        self.emit(
            RelayEvent::new(
                EventKind::ToolCallComplete,
                format!("Tool '{}' completed", call.name),
            )
            .with_session(session_id)
            .with_duration_ms(duration_ms)
            .with_data(json!({
                "tool_name": call.name,
                "call_id": call_id.as_str(),
                "success": success,
                "direction": result.direction,
            })),
        );

        Ok(())
    }

    async fn invoke(
        &self,
        tool: &Tool,
        arguments: Value,
        context: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let future = tool.invoke(arguments, context);
        let outcome = match self.tool_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| ToolError::Timeout {
                    tool: tool.name().to_string(),
                    limit,
                })?,
            None => future.await,
        };
        outcome.map_err(|source| ToolError::HandlerFailed {
            tool: tool.name().to_string(),
            source,
        })
    }

    fn report_tool_error(&self, err: &ToolError, tool_name: &str, session_id: &str) {
        tracing::warn!(
            session_id = %session_id,
            tool = %tool_name,
            kind = %err.kind(),
            "Tool call failed: {}",
            err
        );
        self.emit(
            RelayEvent::new(EventKind::Error, err.to_string())
                .with_session(session_id)
                .with_data(json!({
                    "tool_name": tool_name,
                    "error_type": err.kind().as_str(),
                })),
        );
    }

    fn emit(&self, event: RelayEvent) {
        self.events.emit(event);
    }
}

/// The `session` object of a frame, created empty when absent or not an object.
fn session_object(envelope: &mut Envelope) -> RelayResult<&mut Map<String, Value>> {
    if !matches!(envelope.body.get("session"), Some(Value::Object(_))) {
        envelope
            .body
            .insert("session".to_string(), Value::Object(Map::new()));
    }
    match envelope.body.get_mut("session") {
        Some(Value::Object(session)) => Ok(session),
        _ => Err(RelayError::ProtocolError(
            "session object unavailable".to_string(),
        )),
    }
}

fn apply_policy(session: &mut Map<String, Value>, policy: &PolicySettings) {
    if let Some(message) = &policy.system_message {
        session.insert("instructions".to_string(), json!(message));
    }
    if let Some(temperature) = policy.temperature {
        session.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = policy.top_p {
        session.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(penalty) = policy.presence_penalty {
        session.insert("presence_penalty".to_string(), json!(penalty));
    }
    if let Some(penalty) = policy.frequency_penalty {
        session.insert("frequency_penalty".to_string(), json!(penalty));
    }
    if let Some(max_tokens) = policy.max_tokens {
        session.insert("max_response_output_tokens".to_string(), json!(max_tokens));
    }
    if let Some(disable_audio) = policy.disable_audio {
        session.insert("disable_audio".to_string(), json!(disable_audio));
    }
    if let Some(voice) = policy.voice {
        session.insert("voice".to_string(), json!(voice.as_str()));
    }
}

/// Empty or whitespace-only argument strings are treated as `{}`.
fn parse_arguments(arguments: &str) -> Result<Value, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(arguments).map_err(ToolError::InvalidArguments)
}

/// Drop function-call entries from `response.output`. Returns whether
/// anything was removed.
fn strip_function_calls(envelope: &mut Envelope) -> bool {
    let Some(output) = envelope
        .body
        .get_mut("response")
        .and_then(|r| r.get_mut("output"))
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let before = output.len();
    output.retain(|item| item.get("type").and_then(Value::as_str) != Some("function_call"));
    output.len() != before
}

fn response_summary(envelope: &Envelope, tool_calls: usize) -> Value {
    let response = envelope.body.get("response");
    json!({
        "response_id": response.and_then(|r| r.get("id")).cloned().unwrap_or(Value::Null),
        "status": response.and_then(|r| r.get("status")).cloned().unwrap_or(Value::Null),
        "usage": response.and_then(|r| r.get("usage")).cloned().unwrap_or(Value::Null),
        "tool_calls": tool_calls,
    })
}
