use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{EventStream, Provider, ProviderKind, ToolChoice, Usage};
use crate::streaming::{StreamEvent, TurnBuilder};

/// One scripted backend call
pub enum MockTurn {
    Events(Vec<StreamEvent>),
    Fail(ProviderError),
}

/// What the orchestrator sent on one call
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
    pub tool_choice: ToolChoice,
}

/// A mock provider that replays pre-configured turns for testing
pub struct MockProvider {
    turns: Mutex<VecDeque<MockTurn>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of turns
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before answering, to exercise deadlines and cancellation
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn next(
        &self,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<Vec<StreamEvent>> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            tool_choice,
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(MockTurn::Events(events)) => Ok(events),
            Some(MockTurn::Fail(error)) => Err(error.into()),
            // Return an empty turn if no more pre-configured turns
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        _system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<(Message, Usage)> {
        let mut builder = TurnBuilder::new(self.kind(), None);
        for event in self.next(messages, tools, tool_choice).await? {
            builder.push(event);
        }
        let turn = builder.finish();
        Ok((turn.message, turn.usage))
    }

    async fn stream(
        &self,
        _system: &str,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: ToolChoice,
    ) -> Result<EventStream> {
        let events = self.next(messages, tools, tool_choice).await?;
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}
