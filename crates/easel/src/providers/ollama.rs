use super::base::{EventStream, Provider, ProviderKind, ToolChoice, Usage};
use super::configs::OllamaProviderConfig;
use super::utils::{handle_response, read_json, sanitize_function_name, split_system, tools_to_openai_spec};
use crate::errors::{AgentError, ProviderError};
use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;
use crate::streaming::accumulator::CompletedCall;
use crate::streaming::transport::ndjson_stream;
use crate::streaming::{BlockTracker, StopReason, StreamEvent, StreamNormalizer};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Map, Value};
use std::time::Duration;

pub const OLLAMA_MODEL: &str = "qwen2.5";

pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let input_tokens = data.get("prompt_eval_count").and_then(|v| v.as_u64());
        let output_tokens = data.get("eval_count").and_then(|v| v.as_u64());
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    /// Ollama's native chat format: string content, images as a list of bare
    /// base64 strings, tool calls with object arguments, results keyed by
    /// tool name.
    fn messages_to_ollama_spec(messages: &[&Message]) -> Vec<Value> {
        let mut spec = Vec::new();

        for message in messages {
            let mut text = String::new();
            let mut images = Vec::new();
            let mut tool_calls = Vec::new();

            for content in &message.content {
                match content {
                    MessageContent::Text(t) => text.push_str(&t.text),
                    MessageContent::Image(image) => images.push(json!(image.data)),
                    MessageContent::Thinking(_) => {}
                    MessageContent::ToolRequest(request) => {
                        let arguments = match &request.tool_call {
                            Ok(call) => call.arguments.clone(),
                            Err(_) => json!({}),
                        };
                        tool_calls.push(json!({
                            "function": {
                                "name": sanitize_function_name(request.tool_name()),
                                "arguments": arguments,
                            }
                        }));
                    }
                    MessageContent::ToolResponse(response) => {
                        spec.push(json!({
                            "role": "tool",
                            "content": response.result_text(),
                            "tool_name": response.name,
                        }));
                    }
                }
            }

            if text.is_empty() && images.is_empty() && tool_calls.is_empty() {
                continue;
            }
            let mut converted = json!({
                "role": message.role.as_str(),
                "content": text,
            });
            if !images.is_empty() {
                converted["images"] = json!(images);
            }
            if !tool_calls.is_empty() {
                converted["tool_calls"] = json!(tool_calls);
            }
            spec.push(converted);
        }

        spec
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
        messages_array.extend(Self::messages_to_ollama_spec(&messages));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
            "stream": stream,
        });

        // /api/chat has no tool_choice; withholding the tools is the only switch
        let tools_spec = match tool_choice {
            ToolChoice::Auto => tools_to_openai_spec(tools)?,
            ToolChoice::None => Vec::new(),
        };
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
        }

        let mut options = Map::new();
        if let Some(temp) = self.config.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            options.insert("num_predict".to_string(), json!(tokens));
        }
        if !options.is_empty() {
            payload["options"] = Value::Object(options);
        }

        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));
        let response = self.client.post(&url).json(payload).send().await?;
        handle_response(response).await
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
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

        if let Some(error) = response.get("error").and_then(|e| e.as_str()) {
            return Err(ProviderError::ResponseFormat(error.to_string()).into());
        }
        let original = response.get("message").ok_or_else(|| {
            ProviderError::ResponseFormat("Ollama response has no message".to_string())
        })?;

        let mut message = Message::assistant();
        if let Some(thinking) = original.get("thinking").and_then(|t| t.as_str()) {
            if !thinking.is_empty() {
                message = message.with_thinking(thinking);
            }
        }
        if let Some(text) = original.get("content").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                message = message.with_text(text);
            }
        }
        if let Some(calls) = original.get("tool_calls").and_then(|c| c.as_array()) {
            for (index, call) in calls.iter().enumerate() {
                message = message.with_content(MessageContent::ToolRequest(
                    function_call(index as u32, call).into_tool_request(self.kind()),
                ));
            }
        }

        Ok((message, Self::get_usage(&response)))
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
        Ok(ndjson_stream(response, OllamaNormalizer::default()))
    }
}

fn function_call(index: u32, call: &Value) -> CompletedCall {
    let function = &call["function"];
    let arguments = match function.get("arguments") {
        Some(args @ Value::Object(_)) => Ok(args.clone()),
        Some(Value::String(s)) => crate::streaming::accumulator::parse_arguments(s),
        Some(Value::Null) | None => Ok(json!({})),
        Some(other) => Err(AgentError::InvalidParameters(format!(
            "Tool arguments must be a JSON object, got: {}",
            other
        ))),
    };
    CompletedCall {
        index,
        id: call.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
        name: function["name"].as_str().unwrap_or_default().to_string(),
        arguments,
    }
}

/// Reduces `/api/chat` JSON lines. Tool calls arrive whole, usually in the
/// final `done` line, and carry no id.
#[derive(Debug, Default)]
pub struct OllamaNormalizer {
    tracker: BlockTracker,
}

impl StreamNormalizer for OllamaNormalizer {
    fn normalize(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let chunk: Value = match serde_json::from_str(fragment) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("skipping unparseable ollama line: {}", e);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.get("error") {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(ProviderError::Stream(message));
        }

        let mut out = Vec::new();
        if let Some(message) = chunk.get("message") {
            if let Some(thinking) = message.get("thinking").and_then(|t| t.as_str()) {
                self.tracker.reasoning(thinking, &mut out);
            }
            if let Some(text) = message.get("content").and_then(|t| t.as_str()) {
                self.tracker.text(text, &mut out);
            }
            if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    let function = &call["function"];
                    let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                    let name = function["name"].as_str().unwrap_or_default();
                    let arguments = match &function["arguments"] {
                        Value::String(s) => s.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    let index = self.tracker.start_tool(None, id, name, &mut out);
                    self.tracker.tool_delta(Some(index), &arguments, &mut out);
                    self.tracker.end_tool(index, &mut out);
                }
            }
        }

        if chunk.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
            self.tracker.close(&mut out);
            out.push(StreamEvent::Usage(OllamaProvider::get_usage(&chunk)));
            let reason = chunk
                .get("done_reason")
                .and_then(|r| r.as_str())
                .unwrap_or("stop");
            out.push(StreamEvent::TurnComplete {
                stop_reason: match reason {
                    "stop" => StopReason::EndTurn,
                    "length" => StopReason::MaxTokens,
                    _ => StopReason::Other,
                },
            });
        }

        Ok(out)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.tracker.close(&mut out);
        out
    }
}
