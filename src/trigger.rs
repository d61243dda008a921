//! Declarative trigger surface.
//!
//! A trigger operator is an input source annotated with a
//! [`TriggerMetadata`] record describing the HTTP endpoint an external host
//! should serve it from. The runtime never binds sockets itself; a host
//! reads [`crate::dag::Dag::triggers`] and mounts the routes.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::context::DagContext;
use crate::dag::Dag;
use crate::metadata::{IOField, OperatorCategory, ViewMetadata};
use crate::model::{ModelMessage, ModelOutput, ModelRequest, Role};
use crate::operator::{MapOperator, OperatorBase, OperatorError};
use crate::types::TaskValue;

/// HTTP method of a trigger endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// Declarative description of one trigger endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub method: HttpMethod,
    pub path: String,
    /// Whether the endpoint answers with an SSE stream.
    #[serde(default)]
    pub streaming: bool,
    /// Type name of the expected request body.
    #[serde(default)]
    pub request_model: Option<String>,
    /// Type name of the response body.
    #[serde(default)]
    pub response_model: Option<String>,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
}

fn default_media_type() -> String {
    "application/json".to_string()
}

fn default_status_code() -> u16 {
    200
}

impl TriggerMetadata {
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            streaming: false,
            request_model: None,
            response_model: None,
            media_type: default_media_type(),
            status_code: default_status_code(),
        }
    }

    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self.media_type = "text/event-stream".to_string();
        self
    }
}

/// Wire shape of a chat-completion trigger request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommonLLMHttpRequestBody {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub context: RequestContext,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub conv_uid: Option<String>,
    #[serde(flatten)]
    pub extra: FxHashMap<String, Value>,
}

/// Run a chat DAG and always come back with a [`ModelOutput`].
///
/// Failures are folded into the output envelope with `error_code = 1`, so
/// a host serializes the same body shape for both cases. A terminal value
/// that is not already a `ModelOutput` is wrapped as plain text.
pub async fn safe_chat_call(dag: &Dag, call_data: Value) -> ModelOutput {
    let value = match dag.call(call_data).await {
        Ok(value) => value,
        Err(err) => return ModelOutput::failure(1, err.to_string()),
    };
    if value.get("content").is_some_and(Value::is_array) {
        if let Ok(output) = serde_json::from_value(value.clone()) {
            return output;
        }
    }
    match value.as_str() {
        Some(text) => ModelOutput::success(text),
        None => ModelOutput::success(value.to_string()),
    }
}

/// Parses a [`CommonLLMHttpRequestBody`] into a [`ModelRequest`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestBodyToModelRequestOperator;

#[async_trait]
impl OperatorBase for RequestBodyToModelRequestOperator {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("Request Parser", "request_body_to_model_request")
            .category(OperatorCategory::Trigger)
            .input(IOField::new("body", "CommonLLMHttpRequestBody"))
            .output(IOField::new("request", "ModelRequest"))
            .build()
    }
}

#[async_trait]
impl MapOperator for RequestBodyToModelRequestOperator {
    async fn map(&self, input: TaskValue, _ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        let body: CommonLLMHttpRequestBody = input.parse()?;

        let mut builder = ModelRequest::builder(&body.model)
            .messages(
                body.messages
                    .iter()
                    .map(|m| ModelMessage::new(m.role, &m.content)),
            )
            .stream(body.stream);
        if let Some(temperature) = body.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(top_p) = body.top_p {
            builder = builder.top_p(top_p);
        }
        if let Some(max_new_tokens) = body.max_new_tokens {
            builder = builder.max_new_tokens(max_new_tokens);
        }
        if let Some(conv_uid) = &body.context.conv_uid {
            builder = builder.conv_uid(conv_uid);
        }
        for (key, value) in &body.context.extra {
            builder = builder.extra(key, value.clone());
        }

        let request = builder.build().map_err(|err| OperatorError::Input {
            message: err.to_string(),
        })?;
        Ok(TaskValue::Json(serde_json::to_value(request)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use crate::operator::OperatorKind;
    use serde_json::json;
    use std::sync::Arc;

    struct Fail;

    #[async_trait]
    impl OperatorBase for Fail {
        fn metadata(&self) -> ViewMetadata {
            ViewMetadata::builder("fail", "fail").build()
        }
    }

    #[async_trait]
    impl MapOperator for Fail {
        async fn map(
            &self,
            _input: TaskValue,
            _ctx: &DagContext,
        ) -> Result<TaskValue, OperatorError> {
            Err(OperatorError::Internal("model backend down".to_string()))
        }
    }

    struct Canned;

    #[async_trait]
    impl OperatorBase for Canned {
        fn metadata(&self) -> ViewMetadata {
            ViewMetadata::builder("canned", "canned").build()
        }
    }

    #[async_trait]
    impl MapOperator for Canned {
        async fn map(
            &self,
            _input: TaskValue,
            _ctx: &DagContext,
        ) -> Result<TaskValue, OperatorError> {
            Ok(TaskValue::Json(serde_json::to_value(ModelOutput::success(
                "fine",
            ))?))
        }
    }

    fn single_op_dag(kind: OperatorKind) -> Dag {
        let builder = DagBuilder::new();
        builder.add_operator("only", kind).unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn failures_become_error_outputs_at_the_chat_boundary() {
        let dag = single_op_dag(OperatorKind::Map(Arc::new(Fail)));
        let output = safe_chat_call(&dag, json!({})).await;
        assert_eq!(output.error_code, 1);
        assert!(output.has_error());
        assert!(output.text().is_some_and(|t| t.contains("model backend down")));
    }

    #[tokio::test]
    async fn model_output_terminals_pass_through_unchanged() {
        let dag = single_op_dag(OperatorKind::Map(Arc::new(Canned)));
        let output = safe_chat_call(&dag, json!({})).await;
        assert!(!output.has_error());
        assert_eq!(output.text(), Some("fine"));
    }

    #[tokio::test]
    async fn request_body_parses_into_model_request() {
        let body = json!({
            "model": "proxy/gpt",
            "messages": [{"role": "human", "content": "hello"}],
            "temperature": 0.5,
            "stream": true,
            "context": {"conv_uid": "c-1", "span_id": "s-9"}
        });
        let op = RequestBodyToModelRequestOperator;
        let out = op
            .map(TaskValue::Json(body), &DagContext::new(true))
            .await
            .unwrap();
        let request: ModelRequest = serde_json::from_value(out.into_json().unwrap()).unwrap();
        assert_eq!(request.model, "proxy/gpt");
        assert!(request.stream && request.context.stream);
        assert_eq!(request.context.conv_uid.as_deref(), Some("c-1"));
        assert_eq!(request.context.extra.get("span_id"), Some(&json!("s-9")));
        assert_eq!(request.temperature, Some(0.5));
    }

    #[test]
    fn streaming_trigger_switches_media_type() {
        let meta = TriggerMetadata::post("/api/v1/chat/completions").streaming();
        assert!(meta.streaming);
        assert_eq!(meta.media_type, "text/event-stream");
        assert_eq!(meta.status_code, 200);
    }

    #[test]
    fn trigger_metadata_round_trips() {
        let meta = TriggerMetadata::post("/chat");
        let encoded = serde_json::to_string(&meta).unwrap();
        let decoded: TriggerMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(meta, decoded);
    }
}
