use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{EventStream, Provider, ProviderKind, ToolChoice, Usage};
use super::configs::{AnthropicProviderConfig, ANTHROPIC_DEFAULT_MAX_TOKENS};
use super::utils::{
    check_anthropic_context_length_error, convert_image, handle_response,
    merge_consecutive_roles, read_json, sanitize_function_name, split_system, validate_tools,
    ImageFormat,
};
use crate::errors::{AgentError, ProviderError};
use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;
use crate::streaming::accumulator::CompletedCall;
use crate::streaming::transport::sse_stream;
use crate::streaming::{BlockTracker, StopReason, StreamEvent, StreamNormalizer};

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let input_tokens = data.get("input_tokens").and_then(|v| v.as_u64());
        let output_tokens = data.get("output_tokens").and_then(|v| v.as_u64());
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    fn messages_to_anthropic_spec(messages: &[&Message]) -> Vec<Value> {
        let mut anthropic_messages = Vec::new();

        for message in messages {
            let mut blocks = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.is_empty() {
                            blocks.push(json!({"type": "text", "text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => {
                        blocks.push(convert_image(image, &ImageFormat::Anthropic));
                    }
                    // Replaying thinking requires the signature we do not keep
                    MessageContent::Thinking(_) => {}
                    MessageContent::ToolRequest(request) => {
                        let input = match &request.tool_call {
                            Ok(call) => call.arguments.clone(),
                            Err(_) => json!({}),
                        };
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": request.id,
                            "name": sanitize_function_name(request.tool_name()),
                            "input": input,
                        }));
                    }
                    MessageContent::ToolResponse(response) => {
                        blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": response.id,
                            "content": response.result_text(),
                            "is_error": response.tool_result.is_err(),
                        }));
                    }
                }
            }

            if !blocks.is_empty() {
                anthropic_messages.push(json!({
                    "role": message.role.as_str(),
                    "content": blocks,
                }));
            }
        }

        merge_consecutive_roles(anthropic_messages, "role", "content")
    }

    fn tools_to_anthropic_spec(tools: &[Tool]) -> Result<Vec<Value>> {
        Ok(validate_tools(tools)?
            .into_iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect())
    }

    fn create_request(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
        stream: bool,
    ) -> Result<Value> {
        let (system, messages) = split_system(system, messages);

        let mut payload = json!({
            "model": self.config.model,
            "messages": Self::messages_to_anthropic_spec(&messages),
            "max_tokens": self.config.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS)
        });

        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        let tools_spec = Self::tools_to_anthropic_spec(tools)?;
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
            if tool_choice == ToolChoice::None {
                payload["tool_choice"] = json!({"type": "none"});
            }
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if stream {
            payload["stream"] = json!(true);
        }

        Ok(payload)
    }

    fn response_to_message(&self, response: &Value) -> Result<Message> {
        let blocks = response
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| {
                ProviderError::ResponseFormat("Invalid response format from Anthropic API".into())
            })?;

        let mut message = Message::assistant();
        for (index, block) in blocks.iter().enumerate() {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        message = message.with_text(text);
                    }
                }
                Some("thinking") => {
                    if let Some(thinking) = block.get("thinking").and_then(|t| t.as_str()) {
                        message = message.with_thinking(thinking);
                    }
                }
                Some("tool_use") => {
                    let arguments = match block.get("input") {
                        Some(input @ Value::Object(_)) => Ok(input.clone()),
                        Some(Value::Null) | None => Ok(json!({})),
                        Some(other) => Err(AgentError::InvalidParameters(format!(
                            "Tool arguments must be a JSON object, got: {}",
                            other
                        ))),
                    };
                    let call = CompletedCall {
                        index: index as u32,
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments,
                    };
                    message = message.with_content(MessageContent::ToolRequest(
                        call.into_tool_request(self.kind()),
                    ));
                }
                other => tracing::debug!("ignoring anthropic content block {:?}", other),
            }
        }

        Ok(message)
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(payload)
            .send()
            .await?;

        handle_response(response).await
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<(Message, Usage)> {
        let payload = self.create_request(system, messages, tools, tool_choice, false)?;
        let response = read_json(self.post(&payload).await?).await?;

        let message = self.response_to_message(&response)?;
        let usage = response
            .get("usage")
            .map(Self::get_usage)
            .unwrap_or_default();

        Ok((message, usage))
    }

    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<EventStream> {
        let payload = self.create_request(system, messages, tools, tool_choice, true)?;
        let response = self.post(&payload).await?;
        Ok(sse_stream(response, MessagesNormalizer::default()))
    }
}

/// Reduces the typed Messages API events. Blocks are explicitly bracketed by
/// `content_block_start` / `content_block_stop`, and the block index doubles
/// as the tool-call index.
#[derive(Debug, Default)]
pub struct MessagesNormalizer {
    tracker: BlockTracker,
    open_block: Option<u32>,
}

impl MessagesNormalizer {
    fn block_start(&mut self, index: u32, block: &Value, out: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_block {
            tracing::warn!(open, index, "content block started while another is open");
        }
        self.open_block = Some(index);

        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_use") => {
                let id = block.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                let name = block.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                self.tracker.start_tool(Some(index), id, name, out);
            }
            Some("text") => {
                self.tracker.close(out);
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    self.tracker.text(text, out);
                }
            }
            Some("thinking") => {
                self.tracker.close(out);
                if let Some(thinking) = block.get("thinking").and_then(|t| t.as_str()) {
                    self.tracker.reasoning(thinking, out);
                }
            }
            _ => self.tracker.close(out),
        }
    }

    fn block_delta(&mut self, index: u32, delta: &Value, out: &mut Vec<StreamEvent>) {
        match delta.get("type").and_then(|t| t.as_str()) {
            Some("text_delta") => {
                if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                    self.tracker.text(text, out);
                }
            }
            Some("thinking_delta") => {
                if let Some(thinking) = delta.get("thinking").and_then(|t| t.as_str()) {
                    self.tracker.reasoning(thinking, out);
                }
            }
            Some("input_json_delta") => {
                if let Some(partial) = delta.get("partial_json").and_then(|p| p.as_str()) {
                    self.tracker.tool_delta(Some(index), partial, out);
                }
            }
            _ => {}
        }
    }
}

impl StreamNormalizer for MessagesNormalizer {
    fn normalize(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let event: Value = match serde_json::from_str(fragment) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("skipping unparseable anthropic event: {}", e);
                return Ok(Vec::new());
            }
        };

        let index = event.get("index").and_then(|i| i.as_u64()).map(|i| i as u32);
        let mut out = Vec::new();

        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(usage) = event.pointer("/message/usage") {
                    // the total is left open until message_delta settles the output count
                    let usage = Usage {
                        total_tokens: None,
                        ..AnthropicProvider::get_usage(usage)
                    };
                    out.push(StreamEvent::Usage(usage));
                }
            }
            Some("content_block_start") => match index {
                Some(index) => self.block_start(index, &event["content_block"], &mut out),
                None => tracing::warn!("content_block_start without an index"),
            },
            Some("content_block_delta") => match index {
                Some(index) => self.block_delta(index, &event["delta"], &mut out),
                None => tracing::warn!("content_block_delta without an index"),
            },
            Some("content_block_stop") => {
                if index.is_some() && index == self.open_block {
                    self.tracker.close(&mut out);
                    self.open_block = None;
                }
            }
            Some("message_delta") => {
                self.tracker.close(&mut out);
                self.open_block = None;
                if let Some(usage) = event.get("usage") {
                    // output_tokens here is the running total for the message
                    let output = usage.get("output_tokens").and_then(|v| v.as_u64());
                    let input = usage.get("input_tokens").and_then(|v| v.as_u64());
                    out.push(StreamEvent::Usage(Usage::new(input, output, None)));
                }
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(|r| r.as_str()) {
                    out.push(StreamEvent::TurnComplete {
                        stop_reason: stop_reason(reason),
                    });
                }
            }
            Some("error") => {
                let error = &event["error"];
                return Err(check_anthropic_context_length_error(error)
                    .unwrap_or_else(|| ProviderError::Stream(error.to_string())));
            }
            // ping, message_stop
            _ => {}
        }

        Ok(out)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.tracker.close(&mut out);
        self.open_block = None;
        out
    }
}

fn stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" => StopReason::EndTurn,
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::Other,
    }
}
