use super::accumulator::ToolCallAccumulator;
use super::event::{StopReason, StreamEvent};
use super::sink::{SinkEvent, StreamingContext};
use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::providers::base::{ProviderKind, Usage};

/// One finished backend call
#[derive(Debug, Clone)]
pub struct Turn {
    pub message: Message,
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
    /// Sink events held back because the context asked for buffering
    pub buffered: Vec<SinkEvent>,
}

impl Turn {
    /// A turn from a blocking call, where nothing was streamed
    pub fn complete(message: Message, usage: Usage) -> Self {
        Self {
            message,
            usage,
            stop_reason: None,
            buffered: Vec::new(),
        }
    }
}

/// Folds canonical events into an in-progress assistant turn, forwarding
/// text and reasoning to the sink (or the buffer) in arrival order.
pub struct TurnBuilder<'a> {
    provider: ProviderKind,
    ctx: Option<&'a StreamingContext>,
    text: String,
    reasoning: String,
    accumulator: ToolCallAccumulator,
    requests: Vec<ToolRequest>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    buffered: Vec<SinkEvent>,
    thinking: bool,
}

impl<'a> TurnBuilder<'a> {
    pub fn new(provider: ProviderKind, ctx: Option<&'a StreamingContext>) -> Self {
        Self {
            provider,
            ctx,
            text: String::new(),
            reasoning: String::new(),
            accumulator: ToolCallAccumulator::new(),
            requests: Vec::new(),
            usage: Usage::default(),
            stop_reason: None,
            buffered: Vec::new(),
            thinking: false,
        }
    }

    fn emit(&mut self, event: SinkEvent) {
        let Some(ctx) = self.ctx else {
            return;
        };
        let Some(sink) = &ctx.sink else {
            return;
        };
        if ctx.should_stream_immediately {
            sink.push(event);
        } else {
            self.buffered.push(event);
        }
    }

    fn end_thinking(&mut self) {
        if self.thinking {
            self.thinking = false;
            self.emit(SinkEvent::ThinkingCompleted);
        }
    }

    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => {
                self.end_thinking();
                self.text.push_str(&text);
                self.emit(SinkEvent::Text(text));
            }
            StreamEvent::ReasoningDelta(text) => {
                if !self.thinking {
                    self.thinking = true;
                    self.emit(SinkEvent::ThinkingStarted);
                }
                self.reasoning.push_str(&text);
                self.emit(SinkEvent::Reasoning(text));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.end_thinking();
                self.accumulator.on_start(index, id, name);
            }
            StreamEvent::ToolCallDelta { index, json_chunk } => {
                self.accumulator.on_arg_delta(index, &json_chunk);
            }
            StreamEvent::ToolCallComplete { index } => {
                if let Some(call) = self.accumulator.on_complete(index) {
                    self.requests.push(call.into_tool_request(self.provider));
                }
            }
            StreamEvent::Usage(usage) => self.usage.merge(&usage),
            StreamEvent::TurnComplete { stop_reason } => self.stop_reason = Some(stop_reason),
        }
    }

    pub fn finish(mut self) -> Turn {
        self.end_thinking();
        for call in self.accumulator.finish() {
            tracing::debug!(index = call.index, "closing tool call left open at end of turn");
            self.requests.push(call.into_tool_request(self.provider));
        }

        let mut message = Message::assistant();
        if !self.reasoning.is_empty() {
            message = message.with_thinking(self.reasoning);
        }
        if !self.text.is_empty() {
            message = message.with_text(self.text);
        }
        for request in self.requests {
            message = message.with_content(MessageContent::ToolRequest(request));
        }

        Turn {
            message,
            usage: self.usage,
            stop_reason: self.stop_reason,
            buffered: self.buffered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::sink::StreamSink;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<SinkEvent>>);

    impl StreamSink for RecordingSink {
        fn push(&self, event: SinkEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::ReasoningDelta("thinking".into()),
            StreamEvent::TextDelta("Hi".into()),
            StreamEvent::TextDelta(" there".into()),
            StreamEvent::ToolCallStart {
                index: 0,
                id: "c1".into(),
                name: "addShape".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 0,
                json_chunk: "{\"x\":10,".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 0,
                json_chunk: "\"y\":20}".into(),
            },
            StreamEvent::ToolCallComplete { index: 0 },
            StreamEvent::Usage(Usage::new(Some(5), None, None)),
            StreamEvent::Usage(Usage::new(None, Some(7), None)),
            StreamEvent::TurnComplete {
                stop_reason: StopReason::ToolUse,
            },
        ]
    }

    #[test]
    fn test_folds_events_into_message() {
        let mut builder = TurnBuilder::new(ProviderKind::Anthropic, None);
        for event in events() {
            builder.push(event);
        }
        let turn = builder.finish();

        assert_eq!(turn.message.text(), "Hi there");
        let requests = turn.message.tool_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "c1");
        let call = requests[0].tool_call.as_ref().unwrap();
        assert_eq!(call.arguments, json!({"x": 10, "y": 20}));
        assert_eq!(turn.usage.input_tokens, Some(5));
        assert_eq!(turn.usage.output_tokens, Some(7));
        assert_eq!(turn.stop_reason, Some(StopReason::ToolUse));
        assert!(turn.buffered.is_empty());
    }

    #[test]
    fn test_streams_immediately_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = StreamingContext::new(Some(sink.clone()), "t");
        let mut builder = TurnBuilder::new(ProviderKind::OpenAi, Some(&ctx));
        for event in events() {
            builder.push(event);
        }
        let turn = builder.finish();

        assert!(turn.buffered.is_empty());
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![
                SinkEvent::ThinkingStarted,
                SinkEvent::Reasoning("thinking".into()),
                SinkEvent::ThinkingCompleted,
                SinkEvent::Text("Hi".into()),
                SinkEvent::Text(" there".into()),
            ]
        );
    }

    #[test]
    fn test_buffers_when_not_immediate() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = StreamingContext::new(Some(sink.clone()), "t").with_immediate(false);
        let mut builder = TurnBuilder::new(ProviderKind::OpenAi, Some(&ctx));
        builder.push(StreamEvent::TextDelta("held".into()));
        let turn = builder.finish();

        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(turn.buffered, vec![SinkEvent::Text("held".into())]);
    }

    #[test]
    fn test_open_tool_call_is_closed_at_finish() {
        let mut builder = TurnBuilder::new(ProviderKind::Ollama, None);
        builder.push(StreamEvent::ToolCallStart {
            index: 0,
            id: String::new(),
            name: "renameBoard".into(),
        });
        builder.push(StreamEvent::ToolCallDelta {
            index: 0,
            json_chunk: "{\"name\":\"Plan\"}".into(),
        });
        let turn = builder.finish();
        assert!(turn.message.has_tool_requests());
    }
}
