//! History mappers: shrink a conversation's messages before they reach
//! the model.
//!
//! Mappers operate on whole rounds. Round 0 messages (standalone system
//! prompts) always survive; eviction drops complete rounds so a human turn
//! is never separated from its answer.

use async_trait::async_trait;
use std::sync::Arc;

use crate::model::client::{LlmClient, ModelError};
use crate::model::ModelMessage;

#[async_trait]
pub trait MessageMapper: Send + Sync {
    async fn map(&self, messages: Vec<ModelMessage>) -> Result<Vec<ModelMessage>, ModelError>;
}

/// Keeps the first `keep_start_rounds` and last `keep_end_rounds` rounds.
///
/// When the two windows cover the whole history, everything is kept.
#[derive(Clone, Copy, Debug)]
pub struct BufferedRoundMapper {
    pub keep_start_rounds: usize,
    pub keep_end_rounds: usize,
}

impl BufferedRoundMapper {
    pub fn new(keep_start_rounds: usize, keep_end_rounds: usize) -> Self {
        Self {
            keep_start_rounds,
            keep_end_rounds,
        }
    }
}

fn distinct_rounds(messages: &[ModelMessage]) -> Vec<u32> {
    let mut rounds = Vec::new();
    for message in messages {
        if message.round_index > 0 && !rounds.contains(&message.round_index) {
            rounds.push(message.round_index);
        }
    }
    rounds
}

#[async_trait]
impl MessageMapper for BufferedRoundMapper {
    async fn map(&self, messages: Vec<ModelMessage>) -> Result<Vec<ModelMessage>, ModelError> {
        let rounds = distinct_rounds(&messages);
        if self.keep_start_rounds + self.keep_end_rounds >= rounds.len() {
            return Ok(messages);
        }
        let mut kept: Vec<u32> = rounds[..self.keep_start_rounds].to_vec();
        kept.extend(&rounds[rounds.len() - self.keep_end_rounds..]);
        Ok(messages
            .into_iter()
            .filter(|m| m.round_index == 0 || kept.contains(&m.round_index))
            .collect())
    }
}

/// Evicts the oldest rounds until the history fits a token budget.
///
/// Token counts come from the model's own tokenizer through the client.
pub struct TokenBudgetMapper {
    client: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u32,
}

impl TokenBudgetMapper {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }

    async fn total_tokens(&self, messages: &[ModelMessage]) -> Result<u32, ModelError> {
        let text: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.client.count_tokens(&self.model, &text).await
    }
}

#[async_trait]
impl MessageMapper for TokenBudgetMapper {
    async fn map(&self, mut messages: Vec<ModelMessage>) -> Result<Vec<ModelMessage>, ModelError> {
        loop {
            if self.total_tokens(&messages).await? <= self.max_tokens {
                return Ok(messages);
            }
            let rounds = distinct_rounds(&messages);
            // The current round is never evicted.
            if rounds.len() <= 1 {
                return Ok(messages);
            }
            let oldest = rounds[0];
            messages.retain(|m| m.round_index != oldest);
        }
    }
}
