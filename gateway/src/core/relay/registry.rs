//! Server-side tool registry.
//!
//! Tools are registered once at startup and the registry is frozen behind an
//! `Arc` when it is handed to the relay. Each tool advertises a JSON schema to
//! the backend and owns an async handler that receives the parsed arguments
//! and, when registered with [`ToolRegistry::register_with_context`], the
//! session it runs for.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

/// Boxed future returned by tool handlers.
pub type ToolFuture = Pin<Box<dyn Future<Output = anyhow::Result<ToolResult>> + Send>>;

/// Async tool handler: parsed arguments in, tool result out.
pub type ToolHandler = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// Invocation context handed to context-aware handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub session_id: String,
    pub call_id: String,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            call_id: call_id.into(),
        }
    }
}

/// Where a tool result is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultDirection {
    /// Fed back into the upstream conversation as the function's return value.
    ToServer,
    /// Delivered to the client as a side-channel message; upstream gets an
    /// empty acknowledgement.
    ToClient,
}

/// Tool result payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Text(String),
    Json(Value),
    Empty,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub payload: ToolPayload,
    pub direction: ToolResultDirection,
}

impl ToolResult {
    pub fn new(payload: ToolPayload, direction: ToolResultDirection) -> Self {
        Self { payload, direction }
    }

    /// Text result returned to the model.
    pub fn to_server(text: impl Into<String>) -> Self {
        Self::new(ToolPayload::Text(text.into()), ToolResultDirection::ToServer)
    }

    /// Structured result delivered to the client.
    pub fn to_client(value: Value) -> Self {
        Self::new(ToolPayload::Json(value), ToolResultDirection::ToClient)
    }

    /// Structured failure, always routed back into the conversation so the
    /// model can recover from it.
    pub fn failure(kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self::new(
            ToolPayload::Json(json!({
                "error": {
                    "type": kind.as_str(),
                    "message": message.into(),
                }
            })),
            ToolResultDirection::ToServer,
        )
    }

    /// Text form of the payload as carried on the wire.
    pub fn to_text(&self) -> String {
        match &self.payload {
            ToolPayload::Text(text) => text.clone(),
            ToolPayload::Json(Value::String(text)) => text.clone(),
            ToolPayload::Json(Value::Null) | ToolPayload::Empty => String::new(),
            ToolPayload::Json(value) => value.to_string(),
        }
    }
}

/// Failure categories reported back into the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// The backend completed a call the relay never saw announced.
    UnknownCall,
    /// The backend named a tool that is not registered.
    UnknownTool,
    /// The argument payload was not valid JSON.
    InvalidArguments,
    /// The handler returned an error.
    HandlerFailed,
    /// The handler did not finish within the configured timeout.
    Timeout,
}

impl ToolFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCall => "unknown_call",
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::HandlerFailed => "handler_failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered tool.
#[derive(Clone)]
pub struct Tool {
    name: String,
    schema: Value,
    handler: ToolHandler,
}

impl Tool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Invoke the handler with already-parsed arguments.
    pub fn invoke(&self, arguments: Value, context: ToolContext) -> ToolFuture {
        (self.handler)(arguments, context)
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Registry for server-side tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    // BTreeMap keeps the advertised schema list in a stable order.
    tools: BTreeMap<String, Tool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A second registration under the same name replaces
    /// the first.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, schema: Value, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ToolResult>> + Send + 'static,
    {
        self.register_with_context(name, schema, move |args, _context| handler(args));
    }

    /// Register a tool whose handler also receives the [`ToolContext`].
    pub fn register_with_context<F, Fut>(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        handler: F,
    ) where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ToolResult>> + Send + 'static,
    {
        let name = name.into();
        let handler: ToolHandler = Arc::new(move |args, context| Box::pin(handler(args, context)));
        tracing::debug!(tool = %name, "Registering tool");
        self.tools.insert(
            name.clone(),
            Tool {
                name,
                schema,
                handler,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Schemas of all registered tools, sorted by tool name.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(|tool| tool.schema.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(name: &str) -> Value {
        json!({"type": "function", "name": name, "parameters": {"type": "object"}})
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = ToolRegistry::new();
        registry.register("echo", schema("echo"), |args: Value| async move {
            Ok(ToolResult::to_server(args["text"].as_str().unwrap_or_default()))
        });

        let tool = registry.get("echo").expect("tool registered");
        let result = tool
            .invoke(json!({"text": "hi"}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.to_text(), "hi");
        assert_eq!(result.direction, ToolResultDirection::ToServer);
    }

    #[tokio::test]
    async fn test_context_reaches_handler() {
        let mut registry = ToolRegistry::new();
        registry.register_with_context("whoami", schema("whoami"), |_args, context| async move {
            Ok(ToolResult::to_server(format!(
                "{}/{}",
                context.session_id, context.call_id
            )))
        });

        let result = registry
            .get("whoami")
            .unwrap()
            .invoke(json!({}), ToolContext::new("sess-1", "call-7"))
            .await
            .unwrap();
        assert_eq!(result.to_text(), "sess-1/call-7");
    }

    #[test]
    fn test_schemas_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register("search", schema("search"), |_| async {
            Ok(ToolResult::to_server(""))
        });
        registry.register("report_grounding", schema("report_grounding"), |_| async {
            Ok(ToolResult::to_server(""))
        });

        let names: Vec<_> = registry
            .schemas()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["report_grounding", "search"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("search"));
        assert!(!registry.contains("weather"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.schemas().is_empty());
    }

    #[test]
    fn test_to_text() {
        assert_eq!(ToolResult::to_server("plain").to_text(), "plain");
        assert_eq!(
            ToolResult::to_client(json!({"sources": []})).to_text(),
            r#"{"sources":[]}"#
        );
        assert_eq!(
            ToolResult::new(ToolPayload::Json(Value::Null), ToolResultDirection::ToClient)
                .to_text(),
            ""
        );
        assert_eq!(
            ToolResult::new(ToolPayload::Empty, ToolResultDirection::ToServer).to_text(),
            ""
        );
    }

    #[test]
    fn test_failure_result() {
        let result = ToolResult::failure(ToolFailureKind::UnknownTool, "no tool named 'x'");
        assert_eq!(result.direction, ToolResultDirection::ToServer);
        let parsed: Value = serde_json::from_str(&result.to_text()).unwrap();
        assert_eq!(parsed["error"]["type"], "unknown_tool");
        assert_eq!(parsed["error"]["message"], "no tool named 'x'");
    }
}
