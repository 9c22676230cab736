use serde::{Deserialize, Serialize};

use crate::providers::base::Usage;

/// Why a backend ended its turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    ContentFilter,
    Other,
}

/// The canonical incremental unit every stream normalizer produces,
/// regardless of the backend's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { index: u32, id: String, name: String },
    ToolCallDelta { index: u32, json_chunk: String },
    ToolCallComplete { index: u32 },
    Usage(Usage),
    TurnComplete { stop_reason: StopReason },
}
