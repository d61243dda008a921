//! Chat history operators.
//!
//! [`PreChatHistoryLoadOperator`] runs before the model call: it
//! rehydrates (or creates) the conversation, opens a new round with the
//! user's input, and emits the mapped message list.
//! [`ChatHistorySaveOperator`] runs after: it appends the model answer to
//! the round and persists the conversation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::conversation::mappers::MessageMapper;
use crate::conversation::{ConversationStorage, StorageConversation};
use crate::dag::context::DagContext;
use crate::metadata::{IOField, OperatorCategory, ViewMetadata};
use crate::model::{ModelMessage, ModelOutput};
use crate::operator::{MapOperator, OperatorBase, OperatorError};
use crate::types::TaskValue;

/// Share-data key holding the conv_uid of the running chat.
pub const SHARE_KEY_CONV_UID: &str = "conv_uid";

/// Input payload of [`PreChatHistoryLoadOperator`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatHistoryLoadRequest {
    #[serde(default)]
    pub conv_uid: Option<String>,
    #[serde(default = "default_chat_mode")]
    pub chat_mode: String,
    pub user_input: String,
}

fn default_chat_mode() -> String {
    "chat_normal".to_string()
}

/// Output payload: the conversation id plus the messages to send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatHistoryLoaded {
    pub conv_uid: String,
    pub messages: Vec<ModelMessage>,
}

pub struct PreChatHistoryLoadOperator {
    storage: Arc<dyn ConversationStorage>,
    mapper: Option<Arc<dyn MessageMapper>>,
}

impl PreChatHistoryLoadOperator {
    pub fn new(storage: Arc<dyn ConversationStorage>) -> Self {
        Self {
            storage,
            mapper: None,
        }
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: Arc<dyn MessageMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }
}

#[async_trait]
impl OperatorBase for PreChatHistoryLoadOperator {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("Chat History Loader", "pre_chat_history_load")
            .category(OperatorCategory::Conversation)
            .input(IOField::new("request", "ChatHistoryLoadRequest"))
            .output(IOField::new("loaded", "ChatHistoryLoaded"))
            .build()
    }
}

#[async_trait]
impl MapOperator for PreChatHistoryLoadOperator {
    async fn map(&self, input: TaskValue, ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        let request: ChatHistoryLoadRequest = input.parse()?;

        let mut conversation = match &request.conv_uid {
            Some(conv_uid) => match self.storage.load(conv_uid).await? {
                Some(existing) => existing,
                None => StorageConversation::with_uid(conv_uid, &request.chat_mode),
            },
            None => StorageConversation::new(&request.chat_mode),
        };
        conversation.start_new_round(&request.user_input);
        self.storage.save(&conversation).await?;

        ctx.save_to_share_data(
            SHARE_KEY_CONV_UID,
            json!(conversation.conv_uid.clone()),
            false,
        );

        let messages = match &self.mapper {
            Some(mapper) => mapper.map(conversation.messages.clone()).await?,
            None => conversation.messages.clone(),
        };
        let loaded = ChatHistoryLoaded {
            conv_uid: conversation.conv_uid,
            messages,
        };
        Ok(TaskValue::Json(serde_json::to_value(loaded)?))
    }
}

/// Persists the model answer into the conversation's current round.
///
/// Passes its input through unchanged so it can sit between the model
/// operator and the output stage.
pub struct ChatHistorySaveOperator {
    storage: Arc<dyn ConversationStorage>,
}

impl ChatHistorySaveOperator {
    pub fn new(storage: Arc<dyn ConversationStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl OperatorBase for ChatHistorySaveOperator {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("Chat History Saver", "chat_history_save")
            .category(OperatorCategory::Conversation)
            .input(IOField::new("output", "ModelOutput"))
            .output(IOField::new("output", "ModelOutput"))
            .build()
    }
}

#[async_trait]
impl MapOperator for ChatHistorySaveOperator {
    async fn map(&self, input: TaskValue, ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        let value = input.into_json()?;
        let output: ModelOutput = serde_json::from_value(value.clone())?;

        let conv_uid = ctx
            .get_from_share_data(SHARE_KEY_CONV_UID)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| OperatorError::MissingInput {
                what: format!("share-data key {SHARE_KEY_CONV_UID}"),
            })?;

        if !output.has_error() {
            let mut conversation = self
                .storage
                .load(&conv_uid)
                .await?
                .ok_or_else(|| OperatorError::MissingInput {
                    what: format!("conversation {conv_uid}"),
                })?;
            conversation.add_ai_message(output.gen_text_with_thinking());
            self.storage.save(&conversation).await?;
        }
        Ok(TaskValue::Json(value))
    }
}
