use super::content::{ImageContent, TextContent};
use super::role::Role;
use super::tool::ToolCall;
use crate::errors::AgentResult;
use crate::providers::base::ProviderKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Backend scoped call id, empty for backends that do not assign one
    pub id: String,
    /// The backend that produced the call, if it came from a model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    /// Name as the model sent it, kept so a failed call can still be
    /// rendered back and answered
    #[serde(default)]
    pub name: String,
    pub tool_call: AgentResult<ToolCall>,
}

impl ToolRequest {
    /// The tool name, even when the call failed to parse
    pub fn tool_name(&self) -> &str {
        match &self.tool_call {
            Ok(call) => &call.name,
            Err(_) => &self.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    /// Name of the tool that produced the result. Gemini keys results by name.
    pub name: String,
    pub tool_result: AgentResult<Value>,
}

impl ToolResponse {
    /// The result rendered as the text a model reads
    pub fn result_text(&self) -> String {
        match &self.tool_result {
            Ok(Value::String(s)) => s.clone(),
            Ok(value) => value.to_string(),
            Err(e) => format!("The tool call returned the following error:\n{}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingContent {
    pub thinking: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Content passed inside a message, which can be both simple content and tool content
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    Thinking(ThinkingContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        MessageContent::Image(ImageContent::new(data, mime_type))
    }

    pub fn thinking<S: Into<String>>(thinking: S) -> Self {
        MessageContent::Thinking(ThinkingContent {
            thinking: thinking.into(),
        })
    }

    pub fn tool_request<S: Into<String>>(
        id: S,
        provider: Option<ProviderKind>,
        tool_call: AgentResult<ToolCall>,
    ) -> Self {
        let name = tool_call
            .as_ref()
            .map(|call| call.name.clone())
            .unwrap_or_default();
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            provider,
            name,
            tool_call,
        })
    }

    pub fn tool_response<S: Into<String>, N: Into<String>>(
        id: S,
        name: N,
        tool_result: AgentResult<Value>,
    ) -> Self {
        MessageContent::ToolResponse(ToolResponse {
            id: id.into(),
            name: name.into(),
            tool_result,
        })
    }

    pub fn as_tool_request(&self) -> Option<&ToolRequest> {
        if let MessageContent::ToolRequest(ref tool_request) = self {
            Some(tool_request)
        } else {
            None
        }
    }

    pub fn as_tool_response(&self) -> Option<&ToolResponse> {
        if let MessageContent::ToolResponse(ref tool_response) = self {
            Some(tool_response)
        } else {
            None
        }
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }
}

impl From<super::content::Content> for MessageContent {
    fn from(content: super::content::Content) -> Self {
        match content {
            super::content::Content::Text(text) => MessageContent::Text(text),
            super::content::Content::Image(image) => MessageContent::Image(image),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    /// Create a new system message with the current timestamp
    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// Add any MessageContent to the message
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    /// Add image content to the message
    pub fn with_image<S: Into<String>, T: Into<String>>(self, data: S, mime_type: T) -> Self {
        self.with_content(MessageContent::image(data, mime_type))
    }

    /// Add reasoning content to the message
    pub fn with_thinking<S: Into<String>>(self, thinking: S) -> Self {
        self.with_content(MessageContent::thinking(thinking))
    }

    /// Add a tool request to the message
    pub fn with_tool_request<S: Into<String>>(
        self,
        id: S,
        tool_call: AgentResult<ToolCall>,
    ) -> Self {
        self.with_content(MessageContent::tool_request(id, None, tool_call))
    }

    /// Add a tool response to the message
    pub fn with_tool_response<S: Into<String>, N: Into<String>>(
        self,
        id: S,
        name: N,
        result: AgentResult<Value>,
    ) -> Self {
        self.with_content(MessageContent::tool_response(id, name, result))
    }

    /// All text parts joined together
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .concat()
    }

    pub fn tool_requests(&self) -> Vec<&ToolRequest> {
        self.content
            .iter()
            .filter_map(|c| c.as_tool_request())
            .collect()
    }

    pub fn has_tool_requests(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, MessageContent::ToolRequest(_)))
    }

    /// True when the message carries nothing a backend could render
    pub fn is_empty(&self) -> bool {
        self.content.iter().all(|c| match c {
            MessageContent::Text(t) => t.text.is_empty(),
            MessageContent::Thinking(t) => t.thinking.is_empty(),
            _ => false,
        })
    }
}
