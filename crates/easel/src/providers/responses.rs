//! OpenAI Responses API adapter.
//!
//! The request is split into `instructions` and a flat list of `input` items,
//! where tool calls and their outputs are items of their own rather than
//! parts of a message. Streams are typed SSE events keyed by `output_index`.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{EventStream, Provider, ProviderKind, ToolChoice, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_openai_context_length_error, handle_response, read_json, sanitize_function_name,
    split_system, validate_tools,
};
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::streaming::accumulator::{parse_arguments, CompletedCall};
use crate::streaming::transport::sse_stream;
use crate::streaming::{BlockTracker, StopReason, StreamEvent, StreamNormalizer};

pub struct ResponsesProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl ResponsesProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(usage: &Value) -> Usage {
        Usage::new(
            usage.get("input_tokens").and_then(|v| v.as_u64()),
            usage.get("output_tokens").and_then(|v| v.as_u64()),
            usage.get("total_tokens").and_then(|v| v.as_u64()),
        )
    }

    fn messages_to_input_items(messages: &[&Message]) -> Vec<Value> {
        let mut items = Vec::new();

        for message in messages {
            let (text_type, role) = match message.role {
                Role::Assistant => ("output_text", "assistant"),
                _ => ("input_text", "user"),
            };
            let mut parts = Vec::new();
            let mut calls = Vec::new();

            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.is_empty() {
                            parts.push(json!({"type": text_type, "text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => {
                        parts.push(json!({"type": "input_image", "image_url": image.data_url()}));
                    }
                    MessageContent::Thinking(_) => {}
                    MessageContent::ToolRequest(request) => {
                        let arguments = match &request.tool_call {
                            Ok(call) => call.arguments.to_string(),
                            Err(_) => "{}".to_string(),
                        };
                        calls.push(json!({
                            "type": "function_call",
                            "call_id": request.id,
                            "name": sanitize_function_name(request.tool_name()),
                            "arguments": arguments,
                        }));
                    }
                    MessageContent::ToolResponse(response) => {
                        items.push(json!({
                            "type": "function_call_output",
                            "call_id": response.id,
                            "output": response.result_text(),
                        }));
                    }
                }
            }

            if !parts.is_empty() {
                items.push(json!({"role": role, "content": parts}));
            }
            items.extend(calls);
        }

        items
    }

    fn tools_to_responses_spec(tools: &[Tool]) -> Result<Vec<Value>> {
        Ok(validate_tools(tools)?
            .into_iter()
            .map(|(name, tool)| {
                json!({
                    "type": "function",
                    "name": name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
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
            "input": Self::messages_to_input_items(&messages),
            "store": false,
        });

        if !system.is_empty() {
            payload["instructions"] = json!(system);
        }
        let tools_spec = Self::tools_to_responses_spec(tools)?;
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
            payload["max_output_tokens"] = json!(tokens);
        }
        if stream {
            payload["stream"] = json!(true);
        }

        Ok(payload)
    }

    fn response_to_message(&self, response: &Value) -> Result<Message> {
        let output = response
            .get("output")
            .and_then(|o| o.as_array())
            .ok_or_else(|| ProviderError::ResponseFormat("response has no output".to_string()))?;

        let mut message = Message::assistant();
        for (index, item) in output.iter().enumerate() {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("reasoning") => {
                    let summary: String = item["summary"]
                        .as_array()
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                .collect()
                        })
                        .unwrap_or_default();
                    if !summary.is_empty() {
                        message = message.with_thinking(summary);
                    }
                }
                Some("message") => {
                    for part in item["content"].as_array().into_iter().flatten() {
                        if part["type"] == "output_text" {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                message = message.with_text(text);
                            }
                        }
                    }
                }
                Some("function_call") => {
                    let call = CompletedCall {
                        index: index as u32,
                        id: item["call_id"].as_str().unwrap_or_default().to_string(),
                        name: item["name"].as_str().unwrap_or_default().to_string(),
                        arguments: parse_arguments(item["arguments"].as_str().unwrap_or_default()),
                    };
                    message = message.with_content(MessageContent::ToolRequest(
                        call.into_tool_request(self.kind()),
                    ));
                }
                other => tracing::debug!("ignoring responses output item {:?}", other),
            }
        }

        Ok(message)
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!("{}/v1/responses", self.config.host.trim_end_matches('/'));

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
impl Provider for ResponsesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiResponses
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

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(failure(error).into());
        }

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
        Ok(sse_stream(response, ResponsesNormalizer::default()))
    }
}

fn failure(error: &Value) -> ProviderError {
    check_openai_context_length_error(error).unwrap_or_else(|| {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        ProviderError::Stream(message)
    })
}

/// Reduces Responses API stream events. Function call items are opened by
/// `response.output_item.added`, filled by argument deltas keyed with the
/// same `output_index`, and closed by `response.output_item.done`.
#[derive(Debug, Default)]
pub struct ResponsesNormalizer {
    tracker: BlockTracker,
}

impl ResponsesNormalizer {
    fn index(event: &Value) -> Option<u32> {
        event.get("output_index").and_then(|i| i.as_u64()).map(|i| i as u32)
    }
}

impl StreamNormalizer for ResponsesNormalizer {
    fn normalize(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let event: Value = match serde_json::from_str(fragment) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("skipping unparseable responses event: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut out = Vec::new();
        let delta = event.get("delta").and_then(|d| d.as_str()).unwrap_or_default();

        match event.get("type").and_then(|t| t.as_str()).unwrap_or_default() {
            "response.output_item.added" => {
                let item = &event["item"];
                if item["type"] == "function_call" {
                    let id = item["call_id"].as_str().unwrap_or_default();
                    let name = item["name"].as_str().unwrap_or_default();
                    let index = self.tracker.start_tool(Self::index(&event), id, name, &mut out);
                    if let Some(arguments) = item.get("arguments").and_then(|a| a.as_str()) {
                        self.tracker.tool_delta(Some(index), arguments, &mut out);
                    }
                } else {
                    self.tracker.close(&mut out);
                }
            }
            "response.output_text.delta" => self.tracker.text(delta, &mut out),
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                self.tracker.reasoning(delta, &mut out)
            }
            "response.function_call_arguments.delta" => {
                self.tracker.tool_delta(Self::index(&event), delta, &mut out);
            }
            "response.output_item.done" => match Self::index(&event) {
                Some(index) => self.tracker.end_tool(index, &mut out),
                None => self.tracker.close(&mut out),
            },
            "response.completed" | "response.incomplete" => {
                self.tracker.close(&mut out);
                let response = &event["response"];
                if let Some(usage) = response.get("usage").filter(|u| u.is_object()) {
                    out.push(StreamEvent::Usage(ResponsesProvider::get_usage(usage)));
                }
                let stop_reason = match response
                    .pointer("/incomplete_details/reason")
                    .and_then(|r| r.as_str())
                {
                    None => StopReason::EndTurn,
                    Some("max_output_tokens") => StopReason::MaxTokens,
                    Some("content_filter") => StopReason::ContentFilter,
                    Some(_) => StopReason::Other,
                };
                out.push(StreamEvent::TurnComplete { stop_reason });
            }
            "response.failed" => {
                let error = event.pointer("/response/error").cloned().unwrap_or(Value::Null);
                return Err(failure(&error));
            }
            "error" => return Err(failure(&event)),
            _ => {}
        }

        Ok(out)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.tracker.close(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use crate::streaming::{ChannelSink, StreamingContext};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> ResponsesProvider {
        let config = OpenAiProviderConfig {
            host: server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gpt-4.1".to_string(),
            temperature: None,
            max_tokens: None,
        };
        ResponsesProvider::new(config).unwrap()
    }

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap_or(""), e))
            .collect()
    }

    #[tokio::test]
    async fn test_complete_output_items() -> Result<()> {
        let response_body = json!({
            "id": "resp_1",
            "status": "completed",
            "error": null,
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "placing it"}]},
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "On it."}]},
                {"type": "function_call", "call_id": "call_9", "name": "addShape", "arguments": "{\"x\":3}"}
            ],
            "usage": {"input_tokens": 50, "output_tokens": 20, "total_tokens": 70}
        });

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;
        let provider = provider_for(&mock_server);

        let (message, usage) = provider
            .complete("system", &[Message::user().with_text("Add")], &[], ToolChoice::Auto)
            .await?;

        assert_eq!(message.text(), "On it.");
        assert!(matches!(message.content[0], MessageContent::Thinking(_)));
        let requests = message.tool_requests();
        assert_eq!(requests[0].id, "call_9");
        assert_eq!(
            requests[0].tool_call.as_ref().unwrap(),
            &ToolCall::new("addShape", json!({"x": 3}))
        );
        assert_eq!(usage.total_tokens, Some(70));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_events() -> Result<()> {
        let events = [
            json!({"type": "response.created", "response": {"id": "resp_1"}}),
            json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "reasoning", "id": "rs_1"}}),
            json!({"type": "response.reasoning_summary_text.delta", "output_index": 0, "delta": "thinking"}),
            json!({"type": "response.output_item.added", "output_index": 1, "item": {"type": "message", "id": "msg_1"}}),
            json!({"type": "response.output_text.delta", "output_index": 1, "delta": "Adding"}),
            json!({"type": "response.output_text.delta", "output_index": 1, "delta": " it."}),
            json!({"type": "response.output_item.done", "output_index": 1, "item": {"type": "message"}}),
            json!({"type": "response.output_item.added", "output_index": 2, "item": {"type": "function_call", "call_id": "c1", "name": "addShape", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "output_index": 2, "delta": "{\"x\":10,"}),
            json!({"type": "response.function_call_arguments.delta", "output_index": 2, "delta": "\"y\":20}"}),
            json!({"type": "response.output_item.done", "output_index": 2, "item": {"type": "function_call"}}),
            json!({"type": "response.completed", "response": {"usage": {"input_tokens": 11, "output_tokens": 7, "total_tokens": 18}}}),
        ];

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&events), "text/event-stream"))
            .mount(&mock_server)
            .await;
        let provider = provider_for(&mock_server);

        let (sink, _rx) = ChannelSink::new();
        let ctx = StreamingContext::new(Some(Arc::new(sink)), "test");
        let turn = provider
            .invoke("system", &[Message::user().with_text("Add")], &[], ToolChoice::Auto, Some(&ctx))
            .await?;

        assert_eq!(turn.message.text(), "Adding it.");
        let requests = turn.message.tool_requests();
        assert_eq!(requests[0].id, "c1");
        assert_eq!(
            requests[0].tool_call.as_ref().unwrap().arguments,
            json!({"x": 10, "y": 20})
        );
        assert_eq!(turn.usage, Usage::new(Some(11), Some(7), Some(18)));
        assert_eq!(turn.stop_reason, Some(StopReason::EndTurn));
        Ok(())
    }

    #[test]
    fn test_failed_response_is_fatal() {
        let mut normalizer = ResponsesNormalizer::default();
        let err = normalizer
            .normalize(
                &json!({
                    "type": "response.failed",
                    "response": {"error": {"code": "server_error", "message": "upstream died"}}
                })
                .to_string(),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Stream error reported by backend: upstream died");
    }

    #[test]
    fn test_input_items() -> Result<()> {
        let config = OpenAiProviderConfig {
            host: "http://localhost".into(),
            api_key: "k".into(),
            model: "gpt-4.1".into(),
            temperature: None,
            max_tokens: Some(300),
        };
        let provider = ResponsesProvider::new(config)?;
        let messages = vec![
            Message::user().with_text("Add"),
            Message::assistant()
                .with_text("Sure")
                .with_tool_request("c1", Ok(ToolCall::new("addShape", json!({"x": 1})))),
            Message::user().with_tool_response("c1", "addShape", Ok(json!({"ok": true}))),
        ];
        let payload = provider.create_request("Be brief.", &messages, &[], ToolChoice::Auto, false)?;

        assert_eq!(payload["instructions"], "Be brief.");
        assert_eq!(payload["max_output_tokens"], 300);
        let input = payload["input"].as_array().unwrap();
        assert_eq!(input.len(), 4);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["arguments"], r#"{"x":1}"#);
        assert_eq!(input[3]["type"], "function_call_output");
        assert_eq!(input[3]["output"], r#"{"ok":true}"#);
        Ok(())
    }

    #[test]
    fn test_disabled_tools_stay_declared() -> Result<()> {
        let config = OpenAiProviderConfig {
            host: "http://localhost".into(),
            api_key: "k".into(),
            model: "gpt-4.1".into(),
            temperature: None,
            max_tokens: None,
        };
        let provider = ResponsesProvider::new(config)?;
        let tool = Tool::new("addShape", "Adds a shape", json!({"type": "object"}));
        let payload = provider.create_request(
            "",
            &[Message::user().with_text("Summarize")],
            &[tool],
            ToolChoice::None,
            false,
        )?;
        assert_eq!(payload["tools"][0]["name"], "addShape");
        assert_eq!(payload["tool_choice"], "none");
        Ok(())
    }
}
