use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::base::{EventStream, Provider, ProviderKind, ToolChoice, Usage};
use super::configs::GoogleProviderConfig;
use super::utils::{
    handle_response, merge_consecutive_roles, read_json, sanitize_function_name, split_system,
    validate_tools,
};
use crate::errors::{AgentError, ProviderError};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::streaming::accumulator::CompletedCall;
use crate::streaming::transport::sse_stream;
use crate::streaming::{BlockTracker, StopReason, StreamEvent, StreamNormalizer};

/// Schema keywords the Gemini function declaration parser rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$defs", "default"];

pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(metadata: &Value) -> Usage {
        Usage::new(
            metadata.get("promptTokenCount").and_then(|v| v.as_u64()),
            metadata.get("candidatesTokenCount").and_then(|v| v.as_u64()),
            metadata.get("totalTokenCount").and_then(|v| v.as_u64()),
        )
    }

    fn messages_to_google_spec(messages: &[&Message]) -> Vec<Value> {
        let mut contents = Vec::new();

        for message in messages {
            let mut parts = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.is_empty() {
                            parts.push(json!({"text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => {
                        parts.push(json!({
                            "inlineData": {"mimeType": image.mime_type, "data": image.data}
                        }));
                    }
                    MessageContent::Thinking(_) => {}
                    MessageContent::ToolRequest(request) => {
                        let args = match &request.tool_call {
                            Ok(call) => call.arguments.clone(),
                            Err(_) => json!({}),
                        };
                        parts.push(json!({
                            "functionCall": {
                                "name": sanitize_function_name(request.tool_name()),
                                "args": args,
                            }
                        }));
                    }
                    // Gemini pairs results with calls by function name, not id
                    MessageContent::ToolResponse(response) => {
                        let payload = match &response.tool_result {
                            Ok(value) => json!({"content": value}),
                            Err(e) => json!({"error": e.to_string()}),
                        };
                        parts.push(json!({
                            "functionResponse": {
                                "name": sanitize_function_name(&response.name),
                                "response": payload,
                            }
                        }));
                    }
                }
            }

            if !parts.is_empty() {
                let role = match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                contents.push(json!({"role": role, "parts": parts}));
            }
        }

        merge_consecutive_roles(contents, "role", "parts")
    }

    fn tools_to_google_spec(tools: &[Tool]) -> Result<Vec<Value>> {
        let declarations: Vec<Value> = validate_tools(tools)?
            .into_iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description,
                    "parameters": clean_schema(&tool.input_schema),
                })
            })
            .collect();

        if declarations.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![json!({"functionDeclarations": declarations})])
    }

    fn create_request(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<Value> {
        let (system, messages) = split_system(system, messages);

        let mut payload = json!({
            "contents": Self::messages_to_google_spec(&messages),
        });

        if !system.is_empty() {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let tools_spec = Self::tools_to_google_spec(tools)?;
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
            if tool_choice == ToolChoice::None {
                payload["toolConfig"] = json!({"functionCallingConfig": {"mode": "NONE"}});
            }
        }

        let mut generation = Map::new();
        if let Some(temp) = self.config.temperature {
            generation.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(tokens));
        }
        if !generation.is_empty() {
            payload["generationConfig"] = Value::Object(generation);
        }

        Ok(payload)
    }

    fn response_to_message(&self, response: &Value) -> Result<Message> {
        let candidate = response.pointer("/candidates/0").ok_or_else(|| {
            let reason = response
                .pointer("/promptFeedback/blockReason")
                .and_then(|r| r.as_str())
                .unwrap_or("no candidates");
            ProviderError::ResponseFormat(format!("Gemini returned no candidates: {}", reason))
        })?;

        let mut message = Message::assistant();
        let parts = candidate
            .pointer("/content/parts")
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();

        for (index, part) in parts.iter().enumerate() {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if is_thought(part) {
                    message = message.with_thinking(text);
                } else {
                    message = message.with_text(text);
                }
            } else if let Some(call) = part.get("functionCall") {
                message = message.with_content(MessageContent::ToolRequest(
                    function_call(index as u32, call).into_tool_request(self.kind()),
                ));
            }
        }

        Ok(message)
    }

    async fn post(&self, payload: &Value, stream: bool) -> Result<Response, ProviderError> {
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.config.host.trim_end_matches('/'),
            urlencoding::encode(&self.config.model),
            action
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(payload)
            .send()
            .await?;

        handle_response(response).await
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
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
        let payload = self.create_request(system, messages, tools, tool_choice)?;
        let response = read_json(self.post(&payload, false).await?).await?;

        let message = self.response_to_message(&response)?;
        let usage = response
            .get("usageMetadata")
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
        let payload = self.create_request(system, messages, tools, tool_choice)?;
        let response = self.post(&payload, true).await?;
        Ok(sse_stream(response, GeminiNormalizer::default()))
    }
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false)
}

fn function_call(index: u32, call: &Value) -> CompletedCall {
    let arguments = match call.get("args") {
        Some(args @ Value::Object(_)) => Ok(args.clone()),
        Some(Value::Null) | None => Ok(json!({})),
        Some(other) => Err(AgentError::InvalidParameters(format!(
            "Tool arguments must be a JSON object, got: {}",
            other
        ))),
    };
    CompletedCall {
        index,
        id: call.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
        name: call.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
        arguments,
    }
}

fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), clean_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

/// Reduces `streamGenerateContent` chunks. Every chunk is a full response
/// object holding new parts only; function calls always arrive whole and
/// without an index, so each one is opened, filled and closed in place.
#[derive(Debug, Default)]
pub struct GeminiNormalizer {
    tracker: BlockTracker,
}

impl StreamNormalizer for GeminiNormalizer {
    fn normalize(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let chunk: Value = match serde_json::from_str(fragment) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("skipping unparseable gemini chunk: {}", e);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.get("error") {
            return Err(ProviderError::Stream(error.to_string()));
        }

        let mut out = Vec::new();
        let candidate = &chunk["candidates"][0];
        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if is_thought(part) {
                        self.tracker.reasoning(text, &mut out);
                    } else {
                        self.tracker.text(text, &mut out);
                    }
                } else if let Some(call) = part.get("functionCall") {
                    let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                    let name = call.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    let index = self.tracker.start_tool(None, id, name, &mut out);
                    self.tracker.tool_delta(Some(index), &args.to_string(), &mut out);
                    self.tracker.end_tool(index, &mut out);
                }
            }
        }

        if let Some(metadata) = chunk.get("usageMetadata") {
            out.push(StreamEvent::Usage(GoogleProvider::get_usage(metadata)));
        }

        let finish = candidate
            .get("finishReason")
            .and_then(|r| r.as_str())
            .or_else(|| chunk.pointer("/promptFeedback/blockReason").and_then(|r| r.as_str()));
        if let Some(reason) = finish {
            self.tracker.close(&mut out);
            out.push(StreamEvent::TurnComplete {
                stop_reason: stop_reason(reason),
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

fn stop_reason(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            StopReason::ContentFilter
        }
        _ => StopReason::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use crate::streaming::{ChannelSink, SinkEvent, StreamingContext};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "gemini-2.0-flash";

    fn provider_for(server: &MockServer) -> GoogleProvider {
        let config = GoogleProviderConfig {
            host: server.uri(),
            api_key: "test_api_key".to_string(),
            model: MODEL.to_string(),
            temperature: None,
            max_tokens: Some(512),
        };
        GoogleProvider::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_complete_with_function_call() -> Result<()> {
        let response_body = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "weighing options", "thought": true},
                        {"text": "Adding a shape."},
                        {"functionCall": {"name": "addShape", "args": {"x": 10, "y": 20}}}
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 12, "totalTokenCount": 52}
        });

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
            .and(header("x-goog-api-key", "test_api_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;
        let provider = provider_for(&mock_server);

        let (message, usage) = provider
            .complete("system", &[Message::user().with_text("Add a shape")], &[], ToolChoice::Auto)
            .await?;

        assert_eq!(message.text(), "Adding a shape.");
        assert!(matches!(message.content[0], MessageContent::Thinking(_)));
        let requests = message.tool_requests();
        assert_eq!(requests[0].id, "");
        assert_eq!(
            requests[0].tool_call.as_ref().unwrap(),
            &ToolCall::new("addShape", json!({"x": 10, "y": 20}))
        );
        assert_eq!(usage, Usage::new(Some(40), Some(12), Some(52)));
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_blocked_prompt_is_malformed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "promptFeedback": {"blockReason": "SAFETY"}
            })))
            .mount(&mock_server)
            .await;
        let provider = provider_for(&mock_server);

        let err = provider
            .complete("system", &[Message::user().with_text("Hi")], &[], ToolChoice::Auto)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[tokio::test]
    async fn test_stream_text_and_whole_function_calls() -> Result<()> {
        let chunks = [
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hi"}]}}]}),
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": " there"}]}}]}),
            json!({"candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "addShape", "args": {"x": 1}}},
                {"functionCall": {"name": "renameBoard", "args": {"name": "Plan"}}}
            ]}, "finishReason": "STOP"}],
             "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 6, "totalTokenCount": 14}}),
        ];
        let mut body = String::new();
        for chunk in &chunks {
            body.push_str(&format!("data: {}\r\n\r\n", chunk));
        }

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1beta/models/{}:streamGenerateContent", MODEL)))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&mock_server)
            .await;
        let provider = provider_for(&mock_server);

        let (sink, mut rx) = ChannelSink::new();
        let ctx = StreamingContext::new(Some(Arc::new(sink)), "test");
        let turn = provider
            .invoke("system", &[Message::user().with_text("Hello")], &[], ToolChoice::Auto, Some(&ctx))
            .await?;
        drop(ctx);

        assert_eq!(turn.message.text(), "Hi there");
        let names: Vec<&str> = turn
            .message
            .tool_requests()
            .iter()
            .map(|r| r.tool_name())
            .collect();
        assert_eq!(names, vec!["addShape", "renameBoard"]);
        assert_eq!(turn.usage.total_tokens, Some(14));

        let mut streamed = Vec::new();
        while let Some(SinkEvent::Text(text)) = rx.recv().await {
            streamed.push(text);
        }
        assert_eq!(streamed, vec!["Hi", " there"]);
        Ok(())
    }

    #[test]
    fn test_request_shape() -> Result<()> {
        let config = GoogleProviderConfig {
            host: "http://localhost".into(),
            api_key: "k".into(),
            model: MODEL.into(),
            temperature: Some(0.2),
            max_tokens: None,
        };
        let provider = GoogleProvider::new(config)?;
        let messages = vec![
            Message::user().with_text("Add"),
            Message::assistant()
                .with_tool_request("", Ok(ToolCall::new("addShape", json!({"x": 1})))),
            Message::user().with_tool_response("", "addShape", Ok(json!({"id": "s1"}))),
            Message::user().with_text("thanks"),
        ];
        let tool = Tool::new(
            "addShape",
            "Adds a shape",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {"x": {"type": "number"}}
            }),
        );
        let payload = provider.create_request("Be brief.", &messages, &[tool], ToolChoice::Auto)?;

        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "Be brief.");
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "addShape");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["content"]["id"],
            "s1"
        );
        assert_eq!(contents[2]["parts"][1]["text"], "thanks");

        let parameters = &payload["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(parameters.get("$schema").is_none());
        assert!(parameters.get("additionalProperties").is_none());
        assert_eq!(payload["generationConfig"]["temperature"], json!(0.2f32));
        Ok(())
    }

    #[test]
    fn test_disabled_tools_stay_declared() -> Result<()> {
        let config = GoogleProviderConfig {
            host: "http://localhost".into(),
            api_key: "k".into(),
            model: MODEL.into(),
            temperature: None,
            max_tokens: None,
        };
        let provider = GoogleProvider::new(config)?;
        let tool = Tool::new("addShape", "Adds a shape", json!({"type": "object"}));
        let payload = provider.create_request(
            "",
            &[Message::user().with_text("Summarize")],
            &[tool],
            ToolChoice::None,
        )?;
        assert_eq!(payload["tools"][0]["functionDeclarations"][0]["name"], "addShape");
        assert_eq!(payload["toolConfig"]["functionCallingConfig"]["mode"], "NONE");
        Ok(())
    }
}
