//! Multi-round chat flow: load history, call the model, save the answer.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use awel::conversation::mappers::BufferedRoundMapper;
use awel::conversation::operators::{
    ChatHistoryLoaded, ChatHistorySaveOperator, PreChatHistoryLoadOperator,
};
use awel::conversation::{ConversationStorage, InMemoryConversationStorage, StorageConversation};
use awel::dag::context::DagContext;
use awel::dag::{Dag, DagBuilder};
use awel::metadata::ViewMetadata;
use awel::model::client::LlmClient;
use awel::model::convert::{DefaultMessageConverter, MessageConverter};
use awel::model::{ModelRequest, Role};
use awel::operator::{MapOperator, OperatorBase, OperatorError, OperatorKind};
use awel::types::TaskValue;

use common::MockLlm;

/// Turns the loaded history into a request and answers it with the client.
struct Answer {
    client: Arc<dyn LlmClient>,
}

#[async_trait]
impl OperatorBase for Answer {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("answer", "answer").build()
    }
}

#[async_trait]
impl MapOperator for Answer {
    async fn map(&self, input: TaskValue, _ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        let loaded: ChatHistoryLoaded = input.parse()?;
        let messages = DefaultMessageConverter.convert(loaded.messages, None);
        let request = ModelRequest::builder("mock/model")
            .messages(messages)
            .build()
            .map_err(|e| OperatorError::Input {
                message: e.to_string(),
            })?;
        let output = self.client.generate(&request).await?;
        Ok(TaskValue::Json(serde_json::to_value(output)?))
    }
}

fn chat_dag(storage: Arc<InMemoryConversationStorage>, client: Arc<dyn LlmClient>) -> Dag {
    let builder = DagBuilder::new();
    let load = builder
        .add_operator(
            "load",
            OperatorKind::Map(Arc::new(PreChatHistoryLoadOperator::new(storage.clone()))),
        )
        .unwrap();
    let answer = builder
        .add_operator("answer", OperatorKind::Map(Arc::new(Answer { client })))
        .unwrap();
    let save = builder
        .add_operator(
            "save",
            OperatorKind::Map(Arc::new(ChatHistorySaveOperator::new(storage))),
        )
        .unwrap();
    let _ = load >> answer >> save;
    builder.build().unwrap()
}

#[tokio::test]
async fn two_rounds_accumulate_history() {
    let storage = Arc::new(InMemoryConversationStorage::new());
    let client = Arc::new(
        MockLlm::answering("It compiles to native code.")
            .rule("What is Rust?", "A systems language."),
    );
    let dag = chat_dag(storage.clone(), client);

    let first = dag
        .call(json!({"conv_uid": "conv-1", "user_input": "What is Rust?"}))
        .await
        .unwrap();
    assert_eq!(
        first["content"][0]["data"],
        json!("A systems language.")
    );

    dag.call(json!({"conv_uid": "conv-1", "user_input": "Tell me more"}))
        .await
        .unwrap();

    let conversation = storage.load("conv-1").await.unwrap().unwrap();
    let shape: Vec<(Role, u32)> = conversation
        .messages
        .iter()
        .map(|m| (m.role, m.round_index))
        .collect();
    assert_eq!(
        shape,
        [
            (Role::Human, 1),
            (Role::Ai, 1),
            (Role::Human, 2),
            (Role::Ai, 2),
        ]
    );
    assert_eq!(conversation.messages[1].content, "A systems language.");
}

#[tokio::test]
async fn mapper_trims_middle_rounds_on_load() {
    let storage = Arc::new(InMemoryConversationStorage::new());
    let mut seeded = StorageConversation::with_uid("conv-long", "chat_normal");
    for round in 1..=5 {
        seeded.start_new_round(format!("q{round}"));
        seeded.add_ai_message(format!("a{round}"));
    }
    storage.save(&seeded).await.unwrap();

    let load = PreChatHistoryLoadOperator::new(storage)
        .with_mapper(Arc::new(BufferedRoundMapper::new(1, 1)));
    let ctx = DagContext::new(false);
    let out = load
        .map(
            TaskValue::Json(json!({"conv_uid": "conv-long", "user_input": "q6"})),
            &ctx,
        )
        .await
        .unwrap();
    let loaded: ChatHistoryLoaded = serde_json::from_value(out.into_json().unwrap()).unwrap();

    let mut rounds: Vec<u32> = loaded.messages.iter().map(|m| m.round_index).collect();
    rounds.dedup();
    assert_eq!(rounds, [1, 6]);
    assert_eq!(
        loaded.messages.last().map(|m| m.content.as_str()),
        Some("q6")
    );
}
