//! Conversation state and persistence.
//!
//! A [`StorageConversation`] is the unit of chat history: an envelope
//! (conv_uid, chat mode, timestamps) plus the message list, organised into
//! rounds where one round is one human turn and everything generated for
//! it. Storage backends persist the envelope separately from the messages,
//! both keyed by conv_uid, so listing conversations never loads bodies.

pub mod mappers;
pub mod operators;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ModelMessage, Role};
use crate::rag::store::StorageError;

/// One persisted conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConversation {
    pub conv_uid: String,
    pub chat_mode: String,
    #[serde(default)]
    pub user_name: Option<String>,
    /// Calling system identifier, carried through from the request.
    #[serde(default)]
    pub sys_code: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ModelMessage>,
}

impl StorageConversation {
    /// Fresh conversation with a random conv_uid.
    pub fn new(chat_mode: impl Into<String>) -> Self {
        Self::with_uid(Uuid::new_v4().to_string(), chat_mode)
    }

    pub fn with_uid(conv_uid: impl Into<String>, chat_mode: impl Into<String>) -> Self {
        Self {
            conv_uid: conv_uid.into(),
            chat_mode: chat_mode.into(),
            user_name: None,
            sys_code: None,
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    /// Highest round index present; 0 when empty.
    pub fn current_round(&self) -> u32 {
        self.messages
            .iter()
            .map(|m| m.round_index)
            .max()
            .unwrap_or(0)
    }

    /// Append the human turn that opens a new round, returning its index.
    pub fn start_new_round(&mut self, user_input: impl Into<String>) -> u32 {
        let round = self.current_round() + 1;
        self.messages
            .push(ModelMessage::human(user_input).with_round(round));
        round
    }

    /// Append a model answer to the current round.
    pub fn add_ai_message(&mut self, content: impl Into<String>) {
        let round = self.current_round();
        self.messages.push(ModelMessage::ai(content).with_round(round));
    }

    pub fn add_system_message(&mut self, content: impl Into<String>) {
        self.messages.push(ModelMessage::new(Role::System, content));
    }
}

/// Persistence seam for conversations.
#[async_trait]
pub trait ConversationStorage: Send + Sync {
    /// Persist the envelope and the full message list.
    async fn save(&self, conversation: &StorageConversation) -> Result<(), StorageError>;

    /// Rehydrate one conversation, if present.
    async fn load(&self, conv_uid: &str) -> Result<Option<StorageConversation>, StorageError>;

    async fn delete(&self, conv_uid: &str) -> Result<bool, StorageError>;
}

#[derive(Clone)]
struct Envelope {
    chat_mode: String,
    user_name: Option<String>,
    sys_code: Option<String>,
    created_at: DateTime<Utc>,
}

/// In-memory [`ConversationStorage`]; envelopes and message lists live in
/// separate maps the way a relational backend would split tables.
#[derive(Default)]
pub struct InMemoryConversationStorage {
    envelopes: RwLock<FxHashMap<String, Envelope>>,
    messages: RwLock<FxHashMap<String, Vec<ModelMessage>>>,
}

impl InMemoryConversationStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStorage for InMemoryConversationStorage {
    async fn save(&self, conversation: &StorageConversation) -> Result<(), StorageError> {
        self.envelopes.write().insert(
            conversation.conv_uid.clone(),
            Envelope {
                chat_mode: conversation.chat_mode.clone(),
                user_name: conversation.user_name.clone(),
                sys_code: conversation.sys_code.clone(),
                created_at: conversation.created_at,
            },
        );
        self.messages
            .write()
            .insert(conversation.conv_uid.clone(), conversation.messages.clone());
        Ok(())
    }

    async fn load(&self, conv_uid: &str) -> Result<Option<StorageConversation>, StorageError> {
        let Some(envelope) = self.envelopes.read().get(conv_uid).cloned() else {
            return Ok(None);
        };
        let messages = self
            .messages
            .read()
            .get(conv_uid)
            .cloned()
            .unwrap_or_default();
        Ok(Some(StorageConversation {
            conv_uid: conv_uid.to_string(),
            chat_mode: envelope.chat_mode,
            user_name: envelope.user_name,
            sys_code: envelope.sys_code,
            created_at: envelope.created_at,
            messages,
        }))
    }

    async fn delete(&self, conv_uid: &str) -> Result<bool, StorageError> {
        let existed = self.envelopes.write().remove(conv_uid).is_some();
        self.messages.write().remove(conv_uid);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let storage = InMemoryConversationStorage::new();
        let mut conversation = StorageConversation::new("chat_normal");
        conversation.user_name = Some("ada".to_string());
        conversation.sys_code = Some("web".to_string());
        conversation.start_new_round("hello");
        conversation.add_ai_message("hi there");
        storage.save(&conversation).await.unwrap();

        let loaded = storage.load(&conversation.conv_uid).await.unwrap();
        assert_eq!(loaded, Some(conversation));
    }

    #[tokio::test]
    async fn missing_conversation_loads_as_none() {
        let storage = InMemoryConversationStorage::new();
        assert_eq!(storage.load("nope").await.unwrap(), None);
        assert!(!storage.delete("nope").await.unwrap());
    }

    #[test]
    fn rounds_increase_per_human_turn() {
        let mut conversation = StorageConversation::new("chat_normal");
        conversation.add_system_message("be brief");
        assert_eq!(conversation.start_new_round("q1"), 1);
        conversation.add_ai_message("a1");
        assert_eq!(conversation.start_new_round("q2"), 2);
        assert_eq!(conversation.current_round(), 2);
    }
}
