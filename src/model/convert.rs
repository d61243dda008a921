//! Message normalization before a request reaches a provider.
//!
//! Providers disagree on chat-template details, so the request path runs
//! every message list through a [`MessageConverter`] first. The default
//! converter applies three rules: drop messages not meant for the model,
//! collapse system messages into one (folding them into the last human
//! message when the model has no system role), and move the latest human
//! message to the tail where chat templates expect the current question.

use crate::model::client::ModelMetadata;
use crate::model::{ModelMessage, Role};

pub trait MessageConverter: Send + Sync {
    fn convert(
        &self,
        messages: Vec<ModelMessage>,
        metadata: Option<&ModelMetadata>,
    ) -> Vec<ModelMessage>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMessageConverter;

impl DefaultMessageConverter {
    pub fn new() -> Self {
        Self
    }
}

impl MessageConverter for DefaultMessageConverter {
    fn convert(
        &self,
        messages: Vec<ModelMessage>,
        metadata: Option<&ModelMetadata>,
    ) -> Vec<ModelMessage> {
        let supports_system = metadata.map_or(true, |m| m.supports_system_role);

        let mut system_parts = Vec::new();
        let mut rest: Vec<ModelMessage> = Vec::new();
        for message in messages {
            if !message.pass_to_model {
                continue;
            }
            if message.role == Role::System {
                system_parts.push(message.content);
            } else {
                rest.push(message);
            }
        }

        // The current question goes last regardless of round bookkeeping.
        if let Some(last_human) = rest.iter().rposition(|m| m.role == Role::Human) {
            if last_human != rest.len() - 1 {
                let question = rest.remove(last_human);
                rest.push(question);
            }
        }

        if system_parts.is_empty() {
            return rest;
        }
        let merged = system_parts.join("\n");
        if supports_system {
            let mut out = Vec::with_capacity(rest.len() + 1);
            out.push(ModelMessage::system(merged));
            out.extend(rest);
            out
        } else {
            // No system role: fold the system prompt into the last human
            // message, the current question.
            match rest.iter_mut().rev().find(|m| m.role == Role::Human) {
                Some(last_human) => {
                    last_human.content = format!("{merged}\n\n{}", last_human.content);
                    rest
                }
                None => {
                    let mut out = Vec::with_capacity(rest.len() + 1);
                    out.push(ModelMessage::human(merged));
                    out.extend(rest);
                    out
                }
            }
        }
    }
}
