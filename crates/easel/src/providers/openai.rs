use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{EventStream, Provider, ProviderKind, ToolChoice, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_openai_context_length_error, get_openai_usage, handle_response,
    messages_to_openai_spec, openai_response_to_message, read_json, split_system,
    tools_to_openai_spec, ImageFormat,
};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::streaming::transport::sse_stream;
use crate::streaming::{BlockTracker, StopReason, StreamEvent, StreamNormalizer};

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
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

        let mut messages_array = Vec::new();
        if !system.is_empty() {
            messages_array.push(json!({"role": "system", "content": system}));
        }
        messages_array.extend(messages_to_openai_spec(&messages, &ImageFormat::OpenAi));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array
        });

        let tools_spec = tools_to_openai_spec(tools)?;
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
            if tool_choice == ToolChoice::None {
                payload["tool_choice"] = json!("none");
            }
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }

        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await?;

        handle_response(response).await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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

        // Raise specific error if context length is exceeded
        if let Some(error) = response.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(ProviderError::ResponseFormat(format!("OpenAI API error: {}", error)).into());
        }

        let message = openai_response_to_message(&response, self.kind())?;
        let usage = response
            .get("usage")
            .map(get_openai_usage)
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
        Ok(sse_stream(response, ChatCompletionsNormalizer::default()))
    }
}

/// Reduces chat completions chunks. Tool calls arrive as `tool_calls[]`
/// entries whose first chunk carries the id and name and later chunks only
/// carry argument text. Compatible servers sometimes leave out the index.
#[derive(Debug, Default)]
pub struct ChatCompletionsNormalizer {
    tracker: BlockTracker,
}

impl ChatCompletionsNormalizer {
    fn tool_call(&mut self, call: &Value, out: &mut Vec<StreamEvent>) {
        let index = call.get("index").and_then(|i| i.as_u64()).map(|i| i as u32);
        let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
        let name = call
            .pointer("/function/name")
            .and_then(|n| n.as_str())
            .unwrap_or_default();

        let already_open = index.is_some_and(|index| self.tracker.is_tool_open(index));

        let index = if !name.is_empty() && !already_open {
            Some(self.tracker.start_tool(index, id, name, out))
        } else {
            index
        };

        if let Some(arguments) = call.pointer("/function/arguments").and_then(|a| a.as_str()) {
            self.tracker.tool_delta(index, arguments, out);
        }
    }
}

impl StreamNormalizer for ChatCompletionsNormalizer {
    fn normalize(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let chunk: Value = match serde_json::from_str(fragment) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("skipping unparseable chat completions chunk: {}", e);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.get("error") {
            return Err(check_openai_context_length_error(error)
                .unwrap_or_else(|| ProviderError::Stream(error.to_string())));
        }

        let mut out = Vec::new();
        if let Some(choice) = chunk.pointer("/choices/0") {
            let delta = &choice["delta"];
            let reasoning = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(|r| r.as_str());
            if let Some(reasoning) = reasoning {
                self.tracker.reasoning(reasoning, &mut out);
            }
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                self.tracker.text(text, &mut out);
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    self.tool_call(call, &mut out);
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                self.tracker.close(&mut out);
                out.push(StreamEvent::TurnComplete {
                    stop_reason: stop_reason(reason),
                });
            }
        }

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            out.push(StreamEvent::Usage(get_openai_usage(usage)));
        }

        Ok(out)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.tracker.close(&mut out);
        out
    }
}

fn stop_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::Other,
    }
}
