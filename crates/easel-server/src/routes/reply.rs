use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use easel::{
    errors::{ProviderError, RunError},
    models::message::Message,
    models::tool::ToolCall,
    streaming::{ChannelSink, SinkEvent},
    usage::TokenUsage,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

// Types matching the incoming JSON structure
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    max_iterations: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    content: String,
    #[serde(default)]
    #[serde(rename = "toolInvocations")]
    tool_invocations: Vec<ToolInvocation>,
}

#[derive(Debug, Deserialize)]
struct ToolInvocation {
    state: String,
    #[serde(rename = "toolCallId")]
    tool_call_id: String,
    #[serde(rename = "toolName")]
    tool_name: String,
    args: Value,
    result: Option<Value>,
}

// Response body speaking the Vercel AI data stream protocol
pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> axum::response::Response {
        let headers = [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-vercel-ai-data-stream"), "v1"),
        ];
        (headers, Body::from_stream(self)).into_response()
    }
}

// Rebuild the working message list from the client's history. Completed tool
// invocations become a request/response pair ahead of the assistant text.
fn convert_messages(incoming: Vec<IncomingMessage>) -> Vec<Message> {
    let mut messages = Vec::new();

    for msg in incoming {
        match msg.role.as_str() {
            "user" => {
                messages.push(Message::user().with_text(msg.content));
            }
            "assistant" => {
                for tool in msg.tool_invocations {
                    if tool.state != "result" {
                        continue;
                    }
                    let tool_call = ToolCall::new(tool.tool_name.clone(), tool.args);
                    messages.push(
                        Message::assistant().with_tool_request(tool.tool_call_id.clone(), Ok(tool_call)),
                    );
                    messages.push(Message::user().with_tool_response(
                        tool.tool_call_id,
                        tool.tool_name,
                        Ok(tool.result.unwrap_or(Value::Null)),
                    ));
                }

                if !msg.content.is_empty() {
                    messages.push(Message::assistant().with_text(msg.content));
                }
            }
            _ => {
                tracing::warn!("Unknown role: {}", msg.role);
            }
        }
    }

    messages
}

// Protocol-specific line formatting
struct ProtocolFormatter;

impl ProtocolFormatter {
    fn encode(text: &str) -> String {
        serde_json::to_string(text).unwrap_or_else(|_| String::from("\"\""))
    }

    fn format_event(event: &SinkEvent) -> String {
        match event {
            SinkEvent::Text(text) => format!("0:{}\n", Self::encode(text)),
            SinkEvent::Reasoning(text) => format!("g:{}\n", Self::encode(text)),
            SinkEvent::ThinkingStarted => {
                format!("2:{}\n", json!([{"type": "thinking", "status": "started"}]))
            }
            SinkEvent::ThinkingCompleted => {
                format!("2:{}\n", json!([{"type": "thinking", "status": "completed"}]))
            }
        }
    }

    fn format_error(message: &str) -> String {
        format!("3:{}\n", Self::encode(message))
    }

    fn format_finish(reason: &str, usage: Option<&TokenUsage>) -> String {
        let (prompt, completion) = usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or_default();
        let finish = json!({
            "finishReason": reason,
            "usage": {
                "promptTokens": prompt,
                "completionTokens": completion
            }
        });
        format!("d:{}\n", finish)
    }
}

/// What the client is told when a run fails
fn describe_failure(error: &anyhow::Error) -> String {
    if let Some(run_error) = error.downcast_ref::<RunError>() {
        return run_error.to_string();
    }
    match error.downcast_ref::<ProviderError>() {
        Some(ProviderError::Authentication { .. }) => {
            "The model provider rejected our credentials.".to_string()
        }
        Some(ProviderError::ContextLengthExceeded(_)) => {
            "The conversation is too long for the model. Start a new one.".to_string()
        }
        Some(e) => e.to_string(),
        None => error.to_string(),
    }
}

async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<SseResponse, StatusCode> {
    if let Some(protocol) = headers.get("x-protocol") {
        if protocol.to_str().map(|p| p != "data").unwrap_or(true) {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let agent = state.agent().map_err(|e| {
        tracing::error!("Failed to create provider: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let (tx, rx) = mpsc::channel(100);
    let (sink, mut events) = ChannelSink::new();
    let cancel = CancellationToken::new();

    let messages = convert_messages(request.messages);
    let system = request.system.unwrap_or_else(|| state.system_prompt.clone());
    let tools = state.registry.tools().to_vec();
    let max_iterations = request.max_iterations;

    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            agent
                .run_with_cancel(
                    &system,
                    &messages,
                    &tools,
                    max_iterations,
                    Some(Arc::new(sink)),
                    cancel,
                )
                .await
        })
    };

    tokio::spawn(async move {
        // Ends once the run finishes and drops its sink
        while let Some(event) = events.recv().await {
            if tx.send(ProtocolFormatter::format_event(&event)).await.is_err() {
                tracing::info!("client disconnected, cancelling run");
                cancel.cancel();
                break;
            }
        }

        let finish = match run.await {
            Ok(Ok(reply)) => ProtocolFormatter::format_finish("stop", Some(&reply.usage)),
            Ok(Err(e)) => {
                tracing::error!("Run failed: {:#}", e);
                let _ = tx.send(ProtocolFormatter::format_error(&describe_failure(&e))).await;
                ProtocolFormatter::format_finish("error", None)
            }
            Err(e) => {
                tracing::error!("Run task failed: {}", e);
                let _ = tx.send(ProtocolFormatter::format_error("internal error")).await;
                ProtocolFormatter::format_finish("error", None)
            }
        };
        let _ = tx.send(finish).await;
    });

    Ok(SseResponse::new(ReceiverStream::new(rx)))
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    prompt: String,
}

#[derive(Debug, serde::Serialize)]
struct AskResponse {
    response: String,
    usage: TokenUsage,
}

// simple ask an AI for a response, non streaming
async fn ask_handler(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, StatusCode> {
    let agent = state.agent().map_err(|e| {
        tracing::error!("Failed to create provider: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let messages = vec![Message::user().with_text(request.prompt)];
    let reply = agent
        .run(
            &state.system_prompt,
            &messages,
            state.registry.tools(),
            None,
            None,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to answer: {:#}", e);
            match e.downcast_ref::<RunError>() {
                Some(RunError::DeadlineExceeded(_)) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            }
        })?;

    Ok(Json(AskResponse {
        response: reply.text,
        usage: reply.usage,
    }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(handler))
        .route("/ask", post(ask_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Board;
    use easel::agent::AgentConfig;
    use easel::providers::configs::{OpenAiProviderConfig, ProviderConfig};
    use easel::tool::ToolRegistry;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(chunks: &[Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn text_chunk(text: &str) -> Value {
        json!({"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]})
    }

    fn state_for(server: &MockServer, board: &Board) -> AppState {
        let mut registry = ToolRegistry::new();
        board.register(&mut registry);
        AppState {
            provider_config: ProviderConfig::OpenAi(OpenAiProviderConfig {
                host: server.uri(),
                api_key: "test-key".to_string(),
                model: "gpt-4o".to_string(),
                temperature: None,
                max_tokens: None,
            }),
            agent_config: AgentConfig::default(),
            system_prompt: "You edit boards.".to_string(),
            registry: Arc::new(registry),
        }
    }

    async fn post_reply(state: AppState, body: Value) -> (StatusCode, String) {
        let response = routes(state)
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/reply")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn test_convert_messages_pairs_tool_invocations() {
        let incoming: Vec<IncomingMessage> = serde_json::from_value(json!([
            {"role": "user", "content": "Add a box"},
            {"role": "assistant", "content": "Done.", "toolInvocations": [
                {"state": "result", "toolCallId": "c1", "toolName": "addShape",
                 "args": {"kind": "rectangle", "x": 0, "y": 0}, "result": {"id": "shape-1"}},
                {"state": "call", "toolCallId": "c2", "toolName": "addShape", "args": {}}
            ]}
        ]))
        .unwrap();

        let messages = convert_messages(incoming);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].tool_requests()[0].id, "c1");
        let response = messages[2].content[0].as_tool_response().unwrap();
        assert_eq!(response.name, "addShape");
        assert_eq!(response.tool_result, Ok(json!({"id": "shape-1"})));
        assert_eq!(messages[3].text(), "Done.");
    }

    #[test]
    fn test_protocol_lines() {
        assert_eq!(
            ProtocolFormatter::format_event(&SinkEvent::Text("say \"hi\"\n".into())),
            "0:\"say \\\"hi\\\"\\n\"\n"
        );
        assert_eq!(
            ProtocolFormatter::format_event(&SinkEvent::Reasoning("hmm".into())),
            "g:\"hmm\"\n"
        );
        assert_eq!(ProtocolFormatter::format_error("boom"), "3:\"boom\"\n");
        let usage = TokenUsage::new(12, 3, easel::usage::UsageMethod::Reported);
        assert_eq!(
            ProtocolFormatter::format_finish("stop", Some(&usage)),
            "d:{\"finishReason\":\"stop\",\"usage\":{\"completionTokens\":3,\"promptTokens\":12}}\n"
        );
    }

    #[tokio::test]
    async fn test_reply_streams_text_and_usage() {
        let server = MockServer::start().await;
        let mut chunks = vec![text_chunk("Hi"), text_chunk(" there!")];
        chunks.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
        chunks.push(json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}}));
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&chunks), "text/event-stream"))
            .mount(&server)
            .await;

        let board = Board::new("Untitled");
        let (status, body) = post_reply(
            state_for(&server, &board),
            json!({"messages": [{"role": "user", "content": "Hello"}]}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "0:\"Hi\"");
        assert_eq!(lines[1], "0:\" there!\"");
        let finish: Value = serde_json::from_str(lines[2].trim_start_matches("d:")).unwrap();
        assert_eq!(finish["finishReason"], "stop");
        assert_eq!(finish["usage"]["promptTokens"], 9);
    }

    #[tokio::test]
    async fn test_reply_runs_board_tools() {
        let server = MockServer::start().await;
        let tool_turn = vec![
            json!({"choices": [{"index": 0, "delta": {"content": "Adding it now."}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "addShape", "arguments": "{\"kind\":\"ellipse\","}
            }]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "\"x\":5,\"y\":6}"}
            }]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ];
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&tool_turn), "text/event-stream"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&[text_chunk("Added an ellipse.")]), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let board = Board::new("Untitled");
        let (status, body) = post_reply(
            state_for(&server, &board),
            json!({"messages": [{"role": "user", "content": "Add an ellipse at 5,6"}]}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        // narration before the tool call never reaches the client
        assert!(!body.contains("Adding it now."));
        assert!(body.starts_with("0:\"Added an ellipse.\"\n"));
        assert!(body.contains("d:{\"finishReason\":\"stop\""));

        let shapes = board.list_shapes().unwrap();
        assert_eq!(shapes["shapes"][0]["kind"], "ellipse");
        assert_eq!(shapes["shapes"][0]["x"], 5.0);
    }

    #[tokio::test]
    async fn test_reply_reports_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let board = Board::new("Untitled");
        let (status, body) = post_reply(
            state_for(&server, &board),
            json!({"messages": [{"role": "user", "content": "Hello"}]}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("3:\"The model provider rejected our credentials.\""));
        assert!(body.contains("d:{\"finishReason\":\"error\""));
    }

    #[tokio::test]
    async fn test_rejects_other_protocols() {
        let server = MockServer::start().await;
        let board = Board::new("Untitled");
        let response = routes(state_for(&server, &board))
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/reply")
                    .header("content-type", "application/json")
                    .header("x-protocol", "text")
                    .body(Body::from(json!({"messages": []}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
