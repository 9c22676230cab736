use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::base::{ProviderKind, Usage};
use crate::errors::ProviderError;
use crate::models::content::ImageContent;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::streaming::accumulator::{parse_arguments, CompletedCall};

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub enum ImageFormat {
    OpenAi,
    Anthropic,
}

/// Fold system-role messages into the system prompt and return the rest.
/// Every backend here takes the system prompt in a dedicated slot.
pub fn split_system<'a>(system: &str, messages: &'a [Message]) -> (String, Vec<&'a Message>) {
    let mut prompt = system.to_string();
    let mut rest = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                if !prompt.is_empty() {
                    prompt.push_str("\n\n");
                }
                prompt.push_str(&text);
            }
        } else {
            rest.push(message);
        }
    }
    (prompt, rest)
}

/// Convert internal Message format to OpenAI's chat completions message specification
///   some openai compatible endpoints use the anthropic image spec at the content level
///   even though the message structure is otherwise following openai, the enum switches this
pub fn messages_to_openai_spec(messages: &[&Message], image_format: &ImageFormat) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut text = String::new();
        let mut images = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(t) => text.push_str(&t.text),
                MessageContent::Image(image) => images.push(convert_image(image, image_format)),
                // Reasoning is never replayed to chat completions endpoints
                MessageContent::Thinking(_) => {}
                MessageContent::ToolRequest(request) => {
                    let arguments = match &request.tool_call {
                        Ok(call) => call.arguments.to_string(),
                        Err(_) => "{}".to_string(),
                    };
                    tool_calls.push(json!({
                        "id": request.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(request.tool_name()),
                            "arguments": arguments,
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => {
                    tool_results.push(json!({
                        "role": "tool",
                        "content": response.result_text(),
                        "tool_call_id": response.id
                    }));
                }
            }
        }

        let mut converted = json!({ "role": message.role.as_str() });
        if !images.is_empty() {
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(json!({"type": "text", "text": text}));
            }
            parts.extend(images);
            converted["content"] = json!(parts);
        } else if !text.is_empty() {
            converted["content"] = json!(text);
        }
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }

        // Tool results answer the previous assistant turn, so they come first
        messages_spec.extend(tool_results);
        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            messages_spec.push(converted);
        }
    }

    messages_spec
}

/// Convert an image content into an image json based on format
pub fn convert_image(image: &ImageContent, image_format: &ImageFormat) -> Value {
    match image_format {
        ImageFormat::OpenAi => json!({
            "type": "image_url",
            "image_url": {
                "url": image.data_url()
            }
        }),
        ImageFormat::Anthropic => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.data,
            }
        }),
    }
}

/// Reject tool lists a backend would refuse, and sanitize the names
pub fn validate_tools(tools: &[Tool]) -> Result<Vec<(String, &Tool)>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::with_capacity(tools.len());

    for tool in tools {
        let name = sanitize_function_name(&tool.name);
        if !tool_names.insert(name.clone()) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
        result.push((name, tool));
    }

    Ok(result)
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    Ok(validate_tools(tools)?
        .into_iter()
        .map(|(name, tool)| {
            json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect())
}

/// Convert a chat completions response (OpenAI or compatible) to internal Message format
pub fn openai_response_to_message(response: &Value, provider: ProviderKind) -> Result<Message> {
    let original = response
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::ResponseFormat("response has no choices".to_string()))?;
    let mut message = Message::assistant();

    if let Some(reasoning) = original.get("reasoning_content").and_then(|r| r.as_str()) {
        if !reasoning.is_empty() {
            message = message.with_thinking(reasoning);
        }
    }

    if let Some(text) = original.get("content").and_then(|t| t.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|t| t.as_array()) {
        for (index, tool_call) in tool_calls.iter().enumerate() {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            // Some compatible servers send an object instead of a string
            let arguments = match &tool_call["function"]["arguments"] {
                Value::String(s) => parse_arguments(s),
                Value::Null => parse_arguments(""),
                other => parse_arguments(&other.to_string()),
            };

            let call = CompletedCall {
                index: index as u32,
                id,
                name,
                arguments,
            };
            message = message.with_content(MessageContent::ToolRequest(
                call.into_tool_request(provider),
            ));
        }
    }

    Ok(message)
}

/// Usage from an OpenAI style `usage` object
pub fn get_openai_usage(usage: &Value) -> Usage {
    let input_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64());
    let output_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64());
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

/// Merge adjacent entries with the same role by concatenating their part
/// arrays. Backends with strict user/assistant alternation need this.
pub fn merge_consecutive_roles(turns: Vec<Value>, role_key: &str, parts_key: &str) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(turns.len());
    for turn in turns {
        if let Some(last) = merged.last_mut() {
            if last[role_key] == turn[role_key] {
                if let (Some(existing), Some(extra)) =
                    (last[parts_key].as_array_mut(), turn[parts_key].as_array())
                {
                    existing.extend(extra.iter().cloned());
                    continue;
                }
            }
        }
        merged.push(turn);
    }
    merged
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

pub fn check_openai_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}

pub fn check_anthropic_context_length_error(error: &Value) -> Option<ProviderError> {
    let message = error.get("message")?.as_str()?;
    if message.to_lowercase().contains("prompt is too long") {
        Some(ProviderError::ContextLengthExceeded(message.to_string()))
    } else {
        None
    }
}

/// Pass through a successful response; otherwise read the body and classify
/// the failure.
pub async fn handle_response(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(payload) = serde_json::from_str::<Value>(&body) {
        if let Some(error) = payload.get("error") {
            if let Some(err) = check_openai_context_length_error(error)
                .or_else(|| check_anthropic_context_length_error(error))
            {
                return Err(err);
            }
        }
    }

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication {
            status: status.as_u16(),
            body,
        },
        status if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            ProviderError::ServerError {
                status: status.as_u16(),
                body,
            }
        }
        _ => ProviderError::RequestFailed {
            status: status.as_u16(),
            body,
        },
    })
}

/// Parse a complete response body, treating unreadable payloads as malformed
pub async fn read_json(response: Response) -> Result<Value, ProviderError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ProviderError::ResponseFormat(e.to_string()))
}
