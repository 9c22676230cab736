use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

/// What a sink receives, in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SinkEvent {
    Text(String),
    Reasoning(String),
    ThinkingStarted,
    ThinkingCompleted,
}

/// Push target for output meant for the end user. Delivery is synchronous
/// on the receive path, so implementations must not block.
pub trait StreamSink: Send + Sync {
    fn push(&self, event: SinkEvent);
}

/// A sink backed by an unbounded channel, for handing events to another task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamSink for ChannelSink {
    fn push(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("sink receiver dropped, discarding event");
        }
    }
}

/// Per-run streaming settings. Owned by the orchestrator; providers only
/// ever see a shared reference.
#[derive(Clone)]
pub struct StreamingContext {
    pub sink: Option<Arc<dyn StreamSink>>,
    /// When false, visible output is held back until the orchestrator knows
    /// whether the turn ends in tool calls.
    pub should_stream_immediately: bool,
    pub correlation_id: String,
}

impl StreamingContext {
    pub fn new(sink: Option<Arc<dyn StreamSink>>, correlation_id: impl Into<String>) -> Self {
        Self {
            sink,
            should_stream_immediately: true,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn with_immediate(&self, should_stream_immediately: bool) -> Self {
        Self {
            should_stream_immediately,
            ..self.clone()
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver events straight to the sink, if there is one
    pub fn flush(&self, events: Vec<SinkEvent>) {
        if let Some(sink) = &self.sink {
            for event in events {
                sink.push(event);
            }
        }
    }
}

impl fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingContext")
            .field("has_sink", &self.sink.is_some())
            .field("should_stream_immediately", &self.should_stream_immediately)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}
