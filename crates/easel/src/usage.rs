use serde::{Deserialize, Serialize};

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::Usage;
use crate::token_counter::TokenCounter;

/// Where a usage figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMethod {
    Reported,
    Estimated,
}

/// Token usage for one turn, or summed over a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// `Estimated` as soon as any contributing turn was estimated
    pub method: UsageMethod,
}

impl Default for TokenUsage {
    fn default() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            method: UsageMethod::Reported,
        }
    }
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, method: UsageMethod) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            method,
        }
    }

    fn add(&mut self, turn: &TokenUsage) {
        self.input_tokens += turn.input_tokens;
        self.output_tokens += turn.output_tokens;
        self.total_tokens += turn.total_tokens;
        if turn.method == UsageMethod::Estimated {
            self.method = UsageMethod::Estimated;
        }
    }
}

/// Inputs needed to estimate a turn the backend did not report on
pub struct TurnInput<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [Tool],
}

/// Sums usage turn by turn over one run. Backend figures are used as-is;
/// the estimator only fills in turns that came back without them.
#[derive(Debug, Default)]
pub struct UsageAccountant {
    counter: TokenCounter,
    turns: Vec<TokenUsage>,
    total: TokenUsage,
}

impl UsageAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one turn and return the figures that were counted for it
    pub fn record(&mut self, reported: &Usage, input: TurnInput<'_>, output: &Message) -> TokenUsage {
        let turn = if reported.is_unreported() {
            let input_tokens =
                self.counter
                    .count_chat_tokens(input.system, input.messages, input.tools) as u64;
            let output_tokens = self.counter.count_message_tokens(output) as u64;
            tracing::debug!(input_tokens, output_tokens, "estimating usage for unreported turn");
            TokenUsage::new(input_tokens, output_tokens, UsageMethod::Estimated)
        } else {
            let input_tokens = reported.input_tokens.unwrap_or(0);
            let output_tokens = reported.output_tokens.unwrap_or(0);
            TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens: reported
                    .total_tokens
                    .unwrap_or(input_tokens + output_tokens),
                method: UsageMethod::Reported,
            }
        };
        self.total.add(&turn);
        self.turns.push(turn);
        turn
    }

    pub fn turns(&self) -> &[TokenUsage] {
        &self.turns
    }

    pub fn total(&self) -> TokenUsage {
        self.total
    }
}
