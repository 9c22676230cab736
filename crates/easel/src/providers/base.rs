use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::streaming::{StreamEvent, StreamingContext, Turn, TurnBuilder};

/// The backends an adapter exists for
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAi,
    Anthropic,
    Google,
    Ollama,
    #[serde(rename = "openai_responses")]
    #[strum(serialize = "openai_responses")]
    OpenAiResponses,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        total_tokens: Option<u64>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Overlay a later report. Backends report usage cumulatively within a
    /// turn, so present values replace earlier ones.
    pub fn merge(&mut self, later: &Usage) {
        if later.input_tokens.is_some() {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens.is_some() {
            self.output_tokens = later.output_tokens;
        }
        if later.total_tokens.is_some() {
            self.total_tokens = later.total_tokens;
        }
    }

    /// True when the backend gave no usable figures
    pub fn is_unreported(&self) -> bool {
        self.input_tokens.unwrap_or(0) == 0 && self.output_tokens.unwrap_or(0) == 0
    }
}

/// Whether the model may call the tools it is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Tools stay declared, so a history holding tool calls stays valid,
    /// but the model must answer in text
    None,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Base trait for model backends (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    /// Generate the next message in a single request/response
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<(Message, Usage)>;

    /// Open an incremental response, already reduced to canonical events
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<EventStream>;

    /// Produce one assistant turn. Streams when the context carries a sink,
    /// otherwise falls back to a blocking call.
    async fn invoke(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
        ctx: Option<&StreamingContext>,
    ) -> Result<Turn> {
        let streaming = ctx.is_some_and(StreamingContext::has_sink);
        if !streaming {
            let (message, usage) = self.complete(system, messages, tools, tool_choice).await?;
            return Ok(Turn::complete(message, usage));
        }

        let mut events = self.stream(system, messages, tools, tool_choice).await?;
        let mut builder = TurnBuilder::new(self.kind(), ctx);
        while let Some(event) = events.next().await {
            builder.push(event?);
        }
        Ok(builder.finish())
    }
}
