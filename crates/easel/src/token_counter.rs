use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;

/// Per message framing (role markers, separators)
const MESSAGE_OVERHEAD: usize = 4;
/// Per tool call or result framing on top of its name and arguments
const TOOL_CALL_OVERHEAD: usize = 10;
/// Flat charge for an attached image
const IMAGE_TOKENS: usize = 1000;
/// Per tool definition framing
const TOOL_DEFINITION_OVERHEAD: usize = 8;
/// Priming for the assistant reply
const REPLY_PRIMING: usize = 3;

/// Heuristic token estimator, used when a backend does not report usage.
///
/// Assumes roughly three characters per token, which overestimates plain
/// English a little and fits JSON arguments well.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() / 3).max(1)
    }

    pub fn count_message_tokens(&self, message: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD;
        for content in &message.content {
            tokens += match content {
                MessageContent::Text(text) => self.count_tokens(&text.text),
                MessageContent::Thinking(thinking) => {
                    self.count_tokens(&thinking.thinking) + MESSAGE_OVERHEAD
                }
                MessageContent::Image(_) => IMAGE_TOKENS,
                MessageContent::ToolRequest(request) => {
                    let arguments = match &request.tool_call {
                        Ok(call) => call.arguments.to_string(),
                        Err(_) => String::new(),
                    };
                    self.count_tokens(request.tool_name())
                        + self.count_tokens(&arguments)
                        + TOOL_CALL_OVERHEAD
                }
                MessageContent::ToolResponse(response) => {
                    self.count_tokens(&response.result_text()) + MESSAGE_OVERHEAD
                }
            };
        }
        tokens
    }

    pub fn count_tool_tokens(&self, tools: &[Tool]) -> usize {
        tools
            .iter()
            .map(|tool| {
                self.count_tokens(&tool.name)
                    + self.count_tokens(&tool.description)
                    + self.count_tokens(&tool.input_schema.to_string())
                    + TOOL_DEFINITION_OVERHEAD
            })
            .sum()
    }

    /// Everything a backend would read for one request
    pub fn count_chat_tokens(&self, system: &str, messages: &[Message], tools: &[Tool]) -> usize {
        let mut tokens = REPLY_PRIMING;
        if !system.is_empty() {
            tokens += self.count_tokens(system) + MESSAGE_OVERHEAD;
        }
        tokens += messages
            .iter()
            .map(|m| self.count_message_tokens(m))
            .sum::<usize>();
        tokens + self.count_tool_tokens(tools)
    }
}
