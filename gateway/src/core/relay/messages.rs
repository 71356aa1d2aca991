//! Realtime protocol envelope as seen by the relay.
//!
//! The relay never models full payloads: frames are kept as JSON objects so
//! fields it does not know about survive untouched. What it does model is the
//! `type` tag, mapped onto exhaustive enums so every tag the relay cares about
//! is matched explicitly and everything else lands in `Other`.
//!
//! Client events (client → relay → upstream):
//! - session.update - rewritten with the server policy and tool list
//!
//! Server events (upstream → relay → client):
//! - session.created - sanitized
//! - response.output_item.added - suppressed for function calls
//! - conversation.item.created - function calls recorded, then suppressed
//! - response.function_call_arguments.delta/done - suppressed
//! - response.output_item.done - function calls executed, then suppressed
//! - response.done - tool continuation and output filtering
//! - response.created, input transcription completed, error - observed for
//!   lifecycle events, forwarded untouched
//!
//! Relay-originated events:
//! - conversation.item.create (function_call_output) and response.create upstream
//! - extension.middle_tier_tool_response to the client

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{RelayError, RelayResult};

// =============================================================================
// Envelope
// =============================================================================

#[derive(Deserialize)]
struct TagOnly<'a> {
    #[serde(rename = "type", borrow)]
    tag: Cow<'a, str>,
}

/// Read only the `type` tag of a frame. Pass-through traffic (audio deltas
/// and appends) is classified with this and never fully parsed.
pub fn peek_tag(text: &str) -> RelayResult<Cow<'_, str>> {
    let TagOnly { tag } = serde_json::from_str(text)?;
    Ok(tag)
}

/// A parsed realtime frame: its type tag plus the full JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tag: String,
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Parse a text frame. Frames that are not JSON objects with a string
    /// `type` are protocol errors.
    pub fn parse(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(body) = value else {
            return Err(RelayError::ProtocolError(
                "frame is not a JSON object".to_string(),
            ));
        };
        let tag = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::ProtocolError("frame has no type tag".to_string()))?
            .to_string();
        Ok(Self { tag, body })
    }

    /// The nested `item` object, if any.
    pub fn item(&self) -> Option<&Map<String, Value>> {
        self.body.get("item").and_then(Value::as_object)
    }

    /// Kind of the nested `item`, if any.
    pub fn item_kind(&self) -> Option<ItemKind> {
        self.item()
            .and_then(|item| item.get("type"))
            .and_then(Value::as_str)
            .map(ItemKind::from_tag)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn to_text(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

// =============================================================================
// Client → Upstream
// =============================================================================

/// Client event tags the relay acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventKind {
    /// session.update
    SessionUpdate,
    /// Any other client event; forwarded untouched.
    Other,
}

impl ClientEventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "session.update" => Self::SessionUpdate,
            _ => Self::Other,
        }
    }
}

// =============================================================================
// Upstream → Client
// =============================================================================

/// Server event tags the relay acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEventKind {
    /// session.created
    SessionCreated,
    /// response.output_item.added
    OutputItemAdded,
    /// conversation.item.created
    ConversationItemCreated,
    /// response.function_call_arguments.delta
    FunctionCallArgumentsDelta,
    /// response.function_call_arguments.done
    FunctionCallArgumentsDone,
    /// response.output_item.done
    OutputItemDone,
    /// response.done
    ResponseDone,
    /// response.created
    ResponseCreated,
    /// conversation.item.input_audio_transcription.completed
    InputTranscriptionCompleted,
    /// error
    Error,
    /// Any other server event; forwarded untouched.
    Other,
}

impl ServerEventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "session.created" => Self::SessionCreated,
            "response.output_item.added" => Self::OutputItemAdded,
            "conversation.item.created" => Self::ConversationItemCreated,
            "response.function_call_arguments.delta" => Self::FunctionCallArgumentsDelta,
            "response.function_call_arguments.done" => Self::FunctionCallArgumentsDone,
            "response.output_item.done" => Self::OutputItemDone,
            "response.done" => Self::ResponseDone,
            "response.created" => Self::ResponseCreated,
            "conversation.item.input_audio_transcription.completed" => {
                Self::InputTranscriptionCompleted
            }
            "error" => Self::Error,
            _ => Self::Other,
        }
    }
}

/// Kind of a conversation / output item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    FunctionCall,
    FunctionCallOutput,
    Other,
}

impl ItemKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "function_call" => Self::FunctionCall,
            "function_call_output" => Self::FunctionCallOutput,
            _ => Self::Other,
        }
    }
}

/// Typed view of a function-call item.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCallItem {
    pub call_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl FunctionCallItem {
    pub fn from_item(item: &Map<String, Value>) -> RelayResult<Self> {
        Ok(serde_json::from_value(Value::Object(item.clone()))?)
    }
}

// =============================================================================
// Relay-originated events
// =============================================================================

/// Item carried by a relay-originated conversation.item.create.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

/// Events the relay sends upstream on its own behalf.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RelayUpstreamEvent {
    /// Return a tool result into the conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: OutboundItem },

    /// Ask the model to continue after tool results were injected
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl RelayUpstreamEvent {
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: OutboundItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    pub fn to_text(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events the relay sends to the client outside the model's content stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RelayClientEvent {
    /// Tool result addressed to the client
    #[serde(rename = "extension.middle_tier_tool_response")]
    ToolResponse {
        previous_item_id: Option<String>,
        tool_name: String,
        tool_result: String,
    },
}

impl RelayClientEvent {
    pub fn to_text(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
