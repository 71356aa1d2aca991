//! Per-session bookkeeping for tool calls in flight.
//!
//! A call is opened when the backend creates a function-call conversation
//! item, resolved when the relay has executed the tool for it, and every
//! trace of the response's calls is cleared when `response.done` arrives.
//! The coordinator is owned by the upstream→client pump, which is the only
//! writer, so it carries no lock.

use std::collections::HashMap;
use std::fmt;

/// Opaque identifier for a backend function call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A function call announced by the backend and not yet executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    pub call_id: CallId,
    /// Conversation item that preceded the call; echoed to the client with
    /// side-channel results so it can anchor them in the transcript.
    pub previous_item_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ToolCallCoordinator {
    pending: HashMap<CallId, PendingToolCall>,
    resolved_in_response: usize,
}

impl ToolCallCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new call. Returns `false` and leaves the existing entry alone
    /// if the id is already pending.
    pub fn open(&mut self, call_id: CallId, previous_item_id: Option<String>) -> bool {
        if self.pending.contains_key(&call_id) {
            tracing::debug!(call_id = %call_id, "Ignoring duplicate function call announcement");
            return false;
        }
        self.pending.insert(
            call_id.clone(),
            PendingToolCall {
                call_id,
                previous_item_id,
            },
        );
        true
    }

    pub fn get(&self, call_id: &CallId) -> Option<&PendingToolCall> {
        self.pending.get(call_id)
    }

    /// Remove a pending call once its tool has run. The call still counts
    /// towards the continuation decision at `response.done`.
    pub fn resolve(&mut self, call_id: &CallId) -> Option<PendingToolCall> {
        let call = self.pending.remove(call_id)?;
        self.resolved_in_response += 1;
        Some(call)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.resolved_in_response == 0
    }

    /// Close out the current response: returns how many calls it carried
    /// (pending or resolved) and clears all state.
    pub fn finish_response(&mut self) -> usize {
        let total = self.pending.len() + self.resolved_in_response;
        self.pending.clear();
        self.resolved_in_response = 0;
        total
    }
}
