use std::collections::BTreeSet;

use super::event::StreamEvent;
use crate::errors::ProviderError;

/// Per-backend state machine turning raw protocol fragments into
/// canonical events.
///
/// A fragment is one SSE `data` payload or one JSON line. Fragments that
/// cannot be parsed are logged and produce no events. An `Err` is only
/// returned when the backend itself reports a failure mid-stream.
pub trait StreamNormalizer: Send {
    fn normalize(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, ProviderError>;

    /// Called once the transport is exhausted; closes any open block.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Idle,
    Text,
    Reasoning,
    /// Inside tool calls; holds the index that received the latest event
    ToolCall(u32),
}

/// Tracks which block a stream is in and decides which tool call every
/// argument fragment belongs to.
///
/// Several tool calls may be open at once, since some backends interleave
/// the fragments of parallel calls. A call stays open until the backend
/// ends it or the stream moves on to text or reasoning, and
/// `ToolCallComplete` is emitted exactly once for each.
#[derive(Debug, Default)]
pub struct BlockTracker {
    state: BlockState,
    open: BTreeSet<u32>,
    started: BTreeSet<u32>,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == BlockState::Idle
    }

    pub fn is_tool_open(&self, index: u32) -> bool {
        self.open.contains(&index)
    }

    /// Complete every open tool call, in index order
    fn close_tools(&mut self, out: &mut Vec<StreamEvent>) {
        for index in std::mem::take(&mut self.open) {
            out.push(StreamEvent::ToolCallComplete { index });
        }
    }

    fn next_index(&self) -> u32 {
        self.started.iter().next_back().map_or(0, |i| i + 1)
    }

    /// Where a fragment goes. An explicit index always wins. Without one the
    /// fragment goes to the highest numbered open call; with none open, a
    /// new call is opened at index 0, or past the highest index already used
    /// this turn. Two interleaved calls without indices cannot be told
    /// apart, so this is best effort.
    pub fn resolve_index(&self, index: Option<u32>) -> u32 {
        match index {
            Some(index) => index,
            None => match self.open.iter().next_back() {
                Some(&open) => open,
                None => self.next_index(),
            },
        }
    }

    pub fn text(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.close_tools(out);
        self.state = BlockState::Text;
        out.push(StreamEvent::TextDelta(text.to_string()));
    }

    pub fn reasoning(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.close_tools(out);
        self.state = BlockState::Reasoning;
        out.push(StreamEvent::ReasoningDelta(text.to_string()));
    }

    /// Open a tool call. Without an explicit index the next unused one is
    /// assigned. Returns the index used.
    pub fn start_tool(
        &mut self,
        index: Option<u32>,
        id: &str,
        name: &str,
        out: &mut Vec<StreamEvent>,
    ) -> u32 {
        let index = index.unwrap_or_else(|| self.next_index());
        if self.started.contains(&index) && !self.open.contains(&index) {
            tracing::warn!(index, "tool call index reused within one turn");
        }
        self.open.insert(index);
        self.started.insert(index);
        self.state = BlockState::ToolCall(index);
        out.push(StreamEvent::ToolCallStart {
            index,
            id: id.to_string(),
            name: name.to_string(),
        });
        index
    }

    /// Route an argument fragment to its call, opening the call if no start
    /// marker was seen. Returns the index used, or None when the fragment
    /// belongs to a call that was already completed.
    pub fn tool_delta(
        &mut self,
        index: Option<u32>,
        fragment: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Option<u32> {
        if fragment.is_empty() {
            return None;
        }
        let index = self.resolve_index(index);

        if !self.open.contains(&index) {
            if self.started.contains(&index) {
                tracing::warn!(index, "argument fragment for a completed tool call, skipping");
                return None;
            }
            tracing::debug!(index, "argument fragment without a start marker");
            self.open.insert(index);
            self.started.insert(index);
        }
        self.state = BlockState::ToolCall(index);

        out.push(StreamEvent::ToolCallDelta {
            index,
            json_chunk: fragment.to_string(),
        });
        Some(index)
    }

    /// Complete one tool call, if it is open
    pub fn end_tool(&mut self, index: u32, out: &mut Vec<StreamEvent>) {
        if !self.open.remove(&index) {
            return;
        }
        out.push(StreamEvent::ToolCallComplete { index });
        if self.state == BlockState::ToolCall(index) {
            self.state = match self.open.iter().next_back() {
                Some(&open) => BlockState::ToolCall(open),
                None => BlockState::Idle,
            };
        }
    }

    /// Close whatever is open
    pub fn close(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_tools(out);
        self.state = BlockState::Idle;
    }
}
