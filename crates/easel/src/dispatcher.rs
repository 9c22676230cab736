use serde_json::Value;
use std::sync::Arc;

use crate::errors::{AgentError, AgentResult};
use crate::models::content::ImageContent;
use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::tool::{ToolContext, ToolRegistry};

const IMAGE_NOTE: &str =
    "The tool results above included images. They are attached to this message.";

/// The outcome of one tool call. There is exactly one per request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: AgentResult<Value>,
    pub images: Vec<ImageContent>,
}

impl ToolExecutionResult {
    fn failed(request: &ToolRequest, error: AgentError) -> Self {
        Self {
            tool_call_id: request.id.clone(),
            tool_name: request.tool_name().to_string(),
            result: Err(error),
            images: Vec::new(),
        }
    }
}

/// Runs the tool calls of one turn against the registry
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Execute every request concurrently and return results in request
    /// order. Each handler runs on its own task, so a panic fails only that
    /// call and dropping this future does not stop handlers already started.
    pub async fn execute(&self, requests: &[&ToolRequest], ctx: &ToolContext) -> Vec<ToolExecutionResult> {
        let handles: Vec<_> = requests
            .iter()
            .map(|request| {
                let registry = self.registry.clone();
                let tool_call = request.tool_call.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let call = tool_call?;
                    let handler = registry
                        .lookup(&call.name)
                        .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;
                    handler.call(call.arguments, ctx).await
                })
            })
            .collect();

        let outputs = futures::future::join_all(handles).await;

        requests
            .iter()
            .zip(outputs)
            .map(|(request, output)| {
                let output = output.unwrap_or_else(|e| {
                    Err(AgentError::ExecutionError(if e.is_panic() {
                        format!("tool '{}' panicked", request.tool_name())
                    } else {
                        format!("tool '{}' was aborted", request.tool_name())
                    }))
                });
                match output {
                    Ok(output) => ToolExecutionResult {
                        tool_call_id: request.id.clone(),
                        tool_name: request.tool_name().to_string(),
                        result: Ok(output.value),
                        images: output.images,
                    },
                    Err(error) => {
                        tracing::warn!(
                            correlation_id = %ctx.correlation_id,
                            tool = %request.tool_name(),
                            error = %error,
                            "tool call failed"
                        );
                        ToolExecutionResult::failed(request, error)
                    }
                }
            })
            .collect()
    }

    /// Fold results back into the conversation: one user turn with every
    /// tool result, then a second user turn carrying any images, since
    /// several backends cannot see images nested inside a tool result.
    pub fn render(results: Vec<ToolExecutionResult>) -> Vec<Message> {
        let mut responses = Message::user();
        let mut images = Vec::new();
        for result in results {
            responses = responses.with_tool_response(result.tool_call_id, result.tool_name, result.result);
            images.extend(result.images);
        }

        let mut rendered = vec![responses];
        if !images.is_empty() {
            let mut attachments = Message::user().with_text(IMAGE_NOTE);
            for image in images {
                attachments = attachments.with_content(MessageContent::Image(image));
            }
            rendered.push(attachments);
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::{Tool, ToolCall};
    use crate::tool::ToolOutput;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            Tool::new("addShape", "Adds a shape", json!({"type": "object"})),
            |args, _| async move {
                Ok(ToolOutput::new(json!({"id": "s1", "x": args["x"], "y": args["y"]})))
            },
        );
        registry.register_fn(
            Tool::new("snapshot", "Renders the board", json!({"type": "object"})),
            |_, _| async { Ok(ToolOutput::new(json!("rendered")).with_image("aGk=", "image/png")) },
        );
        registry.register_fn(
            Tool::new("explode", "Always panics", json!({"type": "object"})),
            |_, _| async {
                if true {
                    panic!("boom");
                }
                Ok(ToolOutput::new(json!(null)))
            },
        );
        Arc::new(registry)
    }

    fn requests(message: &Message) -> Vec<&ToolRequest> {
        message.tool_requests()
    }

    #[tokio::test]
    async fn test_results_follow_request_order() {
        let message = Message::assistant()
            .with_tool_request("c1", Ok(ToolCall::new("addShape", json!({"x": 10, "y": 20}))))
            .with_tool_request("c2", Ok(ToolCall::new("doesNotExist", json!({}))))
            .with_tool_request("c3", Err(AgentError::InvalidParameters("bad json".into())))
            .with_tool_request("c4", Ok(ToolCall::new("explode", json!({}))));

        let dispatcher = ToolDispatcher::new(registry());
        let results = dispatcher
            .execute(&requests(&message), &ToolContext::new("run"))
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].tool_call_id, "c1");
        assert_eq!(results[0].result, Ok(json!({"id": "s1", "x": 10, "y": 20})));
        assert_eq!(
            results[1].result,
            Err(AgentError::ToolNotFound("doesNotExist".into()))
        );
        assert_eq!(results[1].tool_name, "doesNotExist");
        assert_eq!(
            results[2].result,
            Err(AgentError::InvalidParameters("bad json".into()))
        );
        assert!(matches!(results[3].result, Err(AgentError::ExecutionError(_))));
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        {
            let running = running.clone();
            let peak = peak.clone();
            registry.register_fn(
                Tool::new("slow", "Sleeps", json!({"type": "object"})),
                move |_, _| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(ToolOutput::new(json!(null)))
                    }
                },
            );
        }

        let message = Message::assistant()
            .with_tool_request("a", Ok(ToolCall::new("slow", json!({}))))
            .with_tool_request("b", Ok(ToolCall::new("slow", json!({}))));
        let results = ToolDispatcher::new(Arc::new(registry))
            .execute(&requests(&message), &ToolContext::new("run"))
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_render_splits_images() {
        let message = Message::assistant()
            .with_tool_request("c1", Ok(ToolCall::new("snapshot", json!({}))))
            .with_tool_request("c2", Ok(ToolCall::new("addShape", json!({"x": 1, "y": 2}))));
        let results = ToolDispatcher::new(registry())
            .execute(&requests(&message), &ToolContext::new("run"))
            .await;

        let rendered = ToolDispatcher::render(results);
        assert_eq!(rendered.len(), 2);

        let responses: Vec<_> = rendered[0]
            .content
            .iter()
            .filter_map(|c| c.as_tool_response())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, "c1");
        assert_eq!(responses[0].tool_result, Ok(json!("rendered")));
        assert_eq!(responses[1].name, "addShape");

        assert_eq!(rendered[1].text(), IMAGE_NOTE);
        assert!(matches!(rendered[1].content[1], MessageContent::Image(_)));
    }

    #[test]
    fn test_render_without_images_is_one_turn() {
        let rendered = ToolDispatcher::render(vec![ToolExecutionResult {
            tool_call_id: "c1".into(),
            tool_name: "addShape".into(),
            result: Ok(json!({})),
            images: Vec::new(),
        }]);
        assert_eq!(rendered.len(), 1);
    }

    #[tokio::test]
    async fn test_call_under_advertised_name_reaches_handler() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            Tool::new("board.add", "Adds a shape", json!({"type": "object"})),
            |args, _| async move { Ok(ToolOutput::new(json!({"added": args["kind"]}))) },
        );
        let spec = crate::providers::utils::tools_to_openai_spec(registry.tools()).unwrap();
        let advertised = spec[0]["function"]["name"].as_str().unwrap().to_string();
        assert_eq!(advertised, "board_add");

        let message = Message::assistant()
            .with_tool_request("c1", Ok(ToolCall::new(advertised, json!({"kind": "box"}))));
        let dispatcher = ToolDispatcher::new(Arc::new(registry));
        let results = dispatcher
            .execute(&requests(&message), &ToolContext::new("run"))
            .await;

        assert_eq!(results[0].result, Ok(json!({"added": "box"})));
    }
}
