//! Reassembles tool-call arguments from arbitrarily chunked JSON fragments.
//!
//! Buffers are keyed by call index; the stream normalizer has already
//! decided which index every fragment belongs to. Each turn gets a fresh
//! accumulator; nothing is carried across turn boundaries.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::errors::{AgentError, AgentResult};
use crate::models::message::ToolRequest;
use crate::models::tool::ToolCall;
use crate::providers::base::ProviderKind;
use crate::providers::utils::is_valid_function_name;

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    buffer: String,
    open: bool,
}

/// A tool call whose argument buffer has been closed and parsed
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: AgentResult<Value>,
}

impl CompletedCall {
    /// Convert into the request stored on the assistant message. Unparseable
    /// arguments and invalid names fail only this call.
    pub fn into_tool_request(self, provider: ProviderKind) -> ToolRequest {
        let name = self.name.clone();
        let tool_call = if !is_valid_function_name(&name) {
            Err(AgentError::ToolNotFound(format!(
                "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                name
            )))
        } else {
            self.arguments.map(|arguments| ToolCall::new(name, arguments))
        };

        ToolRequest {
            id: self.id,
            provider: Some(provider),
            name: self.name,
            tool_call,
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PendingCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the id and name of a call. A start that arrives after
    /// fragments for the same index keeps the buffered fragments.
    pub fn on_start<S: Into<String>, N: Into<String>>(&mut self, index: u32, id: S, name: N) {
        let call = self.calls.entry(index).or_insert_with(|| PendingCall {
            open: true,
            ..Default::default()
        });
        if !call.open {
            tracing::warn!(index, "tool call index restarted after completion");
            *call = PendingCall {
                open: true,
                ..Default::default()
            };
        }
        call.id = id.into();
        call.name = name.into();
    }

    /// Append a fragment to its call's buffer
    pub fn on_arg_delta(&mut self, index: u32, fragment: &str) {
        let call = self.calls.entry(index).or_insert_with(|| PendingCall {
            open: true,
            ..Default::default()
        });
        if call.open {
            call.buffer.push_str(fragment);
        } else {
            tracing::warn!(index, "dropping argument fragment for completed tool call");
        }
    }

    /// Close the buffer and parse it. Returns None for unknown or already
    /// completed indices.
    pub fn on_complete(&mut self, index: u32) -> Option<CompletedCall> {
        let call = self.calls.get_mut(&index)?;
        if !call.open {
            return None;
        }
        call.open = false;
        Some(CompletedCall {
            index,
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: parse_arguments(&call.buffer),
        })
    }

    /// Complete every call still open, in index order
    pub fn finish(&mut self) -> Vec<CompletedCall> {
        let open: Vec<u32> = self.open_indices();
        open.into_iter()
            .filter_map(|index| self.on_complete(index))
            .collect()
    }

    pub fn open_indices(&self) -> Vec<u32> {
        self.calls
            .iter()
            .filter(|(_, call)| call.open)
            .map(|(&index, _)| index)
            .collect()
    }
}

/// Parse a joined argument buffer into a JSON object. An empty buffer means
/// a call without arguments.
pub fn parse_arguments(buffer: &str) -> AgentResult<Value> {
    if buffer.trim().is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<Value>(buffer) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(AgentError::InvalidParameters(format!(
            "Tool arguments must be a JSON object, got: {}",
            other
        ))),
        Err(e) => Err(AgentError::InvalidParameters(format!(
            "Could not interpret tool use parameters: {}",
            e
        ))),
    }
}
