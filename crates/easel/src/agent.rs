use anyhow::Result;
use indoc::indoc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::ToolDispatcher;
use crate::errors::{ProviderError, RunError};
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{Provider, ToolChoice};
use crate::streaming::{SinkEvent, StreamSink, StreamingContext, Turn};
use crate::tool::{ToolContext, ToolRegistry};
use crate::usage::{TokenUsage, TurnInput, UsageAccountant};

pub const DEFAULT_MAX_ITERATIONS: usize = 6;
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(90);

/// Returned when no turn in the run ever produced text
pub const FALLBACK_REPLY: &str =
    "Sorry, I wasn't able to finish that request. Please try again.";

const SUMMARY_PROMPT: &str = indoc! {"
    You have reached the limit of tool calls for this request. Do not call any
    more tools. Summarize what you have done so far and what, if anything, is
    still left for the user to do.
"};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tool round trips allowed before the final summary call
    pub max_iterations: usize,
    /// Bound on one whole run
    pub deadline: Duration,
    /// User turn appended when the iteration budget runs out
    pub summary_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            deadline: DEFAULT_DEADLINE,
            summary_prompt: SUMMARY_PROMPT.trim_end().to_string(),
        }
    }
}

/// The result of one run
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Final answer, never empty
    pub text: String,
    /// Usage summed over every backend call in the run
    pub usage: TokenUsage,
    /// The caller's messages plus everything appended during the run
    pub messages: Vec<Message>,
    /// Backend calls made, including the summary call if there was one
    pub iterations: usize,
}

/// Agent drives a model backend through rounds of tool calls until it
/// answers in plain text
pub struct Agent {
    provider: Box<dyn Provider>,
    dispatcher: ToolDispatcher,
    config: AgentConfig,
}

/// Mutable state of one run. Nothing here outlives the run.
struct RunState {
    correlation_id: String,
    messages: Vec<Message>,
    accountant: UsageAccountant,
    last_text: Option<String>,
    calls: usize,
    deadline: Instant,
}

impl RunState {
    fn reply(self, text: String) -> AgentReply {
        AgentReply {
            text,
            usage: self.accountant.total(),
            messages: self.messages,
            iterations: self.calls,
        }
    }

    fn fallback_text(&self) -> String {
        self.last_text
            .clone()
            .unwrap_or_else(|| FALLBACK_REPLY.to_string())
    }
}

impl Agent {
    pub fn new(provider: Box<dyn Provider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            dispatcher: ToolDispatcher::new(registry),
            config: AgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    /// Run one conversation turn to completion. `max_iterations` overrides
    /// the configured budget when set.
    pub async fn run(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        max_iterations: Option<usize>,
        sink: Option<Arc<dyn StreamSink>>,
    ) -> Result<AgentReply> {
        self.run_with_cancel(
            system,
            messages,
            tools,
            max_iterations,
            sink,
            CancellationToken::new(),
        )
        .await
    }

    /// Like [`Agent::run`], but stops at the next backend call boundary once
    /// `cancel` fires. Tool handlers already running are left to finish.
    pub async fn run_with_cancel(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        max_iterations: Option<usize>,
        sink: Option<Arc<dyn StreamSink>>,
        cancel: CancellationToken,
    ) -> Result<AgentReply> {
        let max_iterations = max_iterations.unwrap_or(self.config.max_iterations);
        let mut state = RunState {
            correlation_id: Uuid::new_v4().to_string(),
            messages: messages.to_vec(),
            accountant: UsageAccountant::new(),
            last_text: None,
            calls: 0,
            deadline: Instant::now() + self.config.deadline,
        };
        let ctx = StreamingContext::new(sink, state.correlation_id.clone());
        let tool_ctx = ToolContext::new(state.correlation_id.clone());

        tracing::info!(
            correlation_id = %state.correlation_id,
            provider = %self.provider.kind(),
            model = self.provider.model(),
            max_iterations,
            "starting run"
        );

        for iteration in 0..max_iterations {
            // Narration ahead of a tool call is not meant for the user, so hold
            // output back whenever the model could answer with tool calls.
            let turn_ctx = ctx.with_immediate(tools.is_empty());
            let turn = self
                .invoke(&mut state, system, tools, ToolChoice::Auto, &turn_ctx, &cancel)
                .await?;

            let text = turn.message.text();
            if !text.is_empty() {
                state.last_text = Some(text.clone());
            }

            let requests = turn.message.tool_requests();
            if requests.is_empty() {
                tracing::debug!(
                    correlation_id = %state.correlation_id,
                    iteration,
                    "turn ended without tool calls"
                );
                ctx.flush(turn.buffered);
                if !turn.message.is_empty() {
                    state.messages.push(turn.message.clone());
                }
                let text = if text.is_empty() {
                    tracing::warn!(correlation_id = %state.correlation_id, "final turn was empty");
                    let fallback = state.fallback_text();
                    ctx.flush(vec![SinkEvent::Text(fallback.clone())]);
                    fallback
                } else {
                    text
                };
                return Ok(state.reply(text));
            }

            tracing::debug!(
                correlation_id = %state.correlation_id,
                iteration,
                tool_calls = requests.len(),
                discarded = turn.buffered.len(),
                "executing tool calls"
            );
            let results = self.dispatcher.execute(&requests, &tool_ctx).await;
            state.messages.push(turn.message.clone());
            state.messages.extend(ToolDispatcher::render(results));
        }

        self.summarize(state, system, tools, &ctx, &cancel).await
    }

    /// The iteration budget ran out: ask once more for a summary. The tools
    /// stay declared, since the history already holds calls to them, but the
    /// model may not call any. This call never fails the run on a backend
    /// error.
    async fn summarize(
        &self,
        mut state: RunState,
        system: &str,
        tools: &[Tool],
        ctx: &StreamingContext,
        cancel: &CancellationToken,
    ) -> Result<AgentReply> {
        tracing::warn!(
            correlation_id = %state.correlation_id,
            "iteration budget exhausted, requesting a summary"
        );
        state
            .messages
            .push(Message::user().with_text(self.config.summary_prompt.clone()));

        let final_ctx = ctx.with_immediate(true);
        match self
            .invoke(&mut state, system, tools, ToolChoice::None, &final_ctx, cancel)
            .await
        {
            Ok(turn) => {
                let text = turn.message.text();
                if !text.is_empty() {
                    if turn.message.has_tool_requests() {
                        tracing::warn!(
                            correlation_id = %state.correlation_id,
                            "ignoring tool calls in the summary turn"
                        );
                    }
                    state.messages.push(Message::assistant().with_text(text.clone()));
                    return Ok(state.reply(text));
                }
                tracing::warn!(correlation_id = %state.correlation_id, "summary turn was empty");
            }
            Err(e) if e.downcast_ref::<RunError>().is_some() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    correlation_id = %state.correlation_id,
                    error = %e,
                    "summary call failed, falling back to last text"
                );
            }
        }

        let text = state.fallback_text();
        ctx.flush(vec![SinkEvent::Text(text.clone())]);
        Ok(state.reply(text))
    }

    /// One backend call, bounded by the run deadline and the cancel token.
    /// Usage is recorded against the messages the call was given.
    async fn invoke(
        &self,
        state: &mut RunState,
        system: &str,
        tools: &[Tool],
        tool_choice: ToolChoice,
        ctx: &StreamingContext,
        cancel: &CancellationToken,
    ) -> Result<Turn> {
        state.calls += 1;
        let turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunError::Cancelled.into()),
            _ = tokio::time::sleep_until(state.deadline) => {
                Err(RunError::DeadlineExceeded(self.config.deadline).into())
            }
            turn = self.provider.invoke(system, &state.messages, tools, tool_choice, Some(ctx)) => turn,
        };
        let turn = turn.map_err(|e| {
            if let Some(provider_error) = e.downcast_ref::<ProviderError>() {
                tracing::error!(
                    correlation_id = %state.correlation_id,
                    provider = %self.provider.kind(),
                    error = %provider_error,
                    "backend call failed"
                );
            }
            e
        })?;

        let counted = state.accountant.record(
            &turn.usage,
            TurnInput {
                system,
                messages: &state.messages,
                tools,
            },
            &turn.message,
        );
        tracing::debug!(
            correlation_id = %state.correlation_id,
            call = state.calls,
            input_tokens = counted.input_tokens,
            output_tokens = counted.output_tokens,
            "turn complete"
        );
        Ok(turn)
    }
}
