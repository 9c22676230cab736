use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors scoped to a single tool call. These are reported back to the model
/// as that call's result and never abort a run.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Failures talking to a backend. Any of these ends the run.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed ({status}): {body}")]
    Authentication { status: u16, body: String },

    #[error("Request failed ({status}): {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    ResponseFormat(String),

    #[error("Stream error reported by backend: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        ProviderError::Transport(error.to_string())
    }
}

/// Reasons a run stopped before producing an answer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("Run cancelled")]
    Cancelled,

    #[error("Run exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}
