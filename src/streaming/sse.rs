//! Server-sent-event framing for chat completion streams.
//!
//! [`OpenAiStreamOperator`] translates a stream of [`ModelOutput`] JSON
//! frames into OpenAI-compatible `chat.completion.chunk` SSE frames: one
//! leading role delta, one chunk per content delta, a finish chunk, then
//! the `[DONE]` sentinel. A mid-stream failure becomes a single error frame
//! followed by `[DONE]`; nothing is ever emitted after the sentinel.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::StreamExt;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::dag::context::DagContext;
use crate::metadata::{IOField, OperatorCategory, ViewMetadata};
use crate::model::ModelOutput;
use crate::operator::{OperatorBase, OperatorError, StreamOperator};
use crate::types::TaskStream;

/// SSE terminal sentinel frame.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Wrap a JSON payload as one SSE data frame.
pub fn sse_frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// Extract the payload of one SSE line.
///
/// Returns `None` for lines without a `data:` prefix (comments, blank
/// keep-alives). The `[DONE]` sentinel comes back as the literal string.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Translates model output frames into OpenAI-compatible SSE chunks.
pub struct OpenAiStreamOperator {
    model: String,
}

impl OpenAiStreamOperator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    fn chunk(&self, id: &str, created: i64, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}

#[async_trait]
impl OperatorBase for OpenAiStreamOperator {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("OpenAI SSE Stream", "openai_sse_stream")
            .category(OperatorCategory::Output)
            .input(IOField::new("frames", "ModelOutput").list())
            .output(IOField::new("sse", "String").list())
            .build()
    }

    fn incremental_output(&self) -> bool {
        true
    }
}

#[async_trait]
impl StreamOperator for OpenAiStreamOperator {
    async fn transform(
        &self,
        mut input: TaskStream,
        _ctx: &DagContext,
    ) -> Result<TaskStream, OperatorError> {
        let id = format!("chatcmpl-{}", Uuid::new_v4());
        let created = Utc::now().timestamp();
        let model = self.model.clone();
        let operator = OpenAiStreamOperator { model };

        let (tx, rx) = flume::unbounded::<Result<Value, OperatorError>>();
        tokio::spawn(async move {
            // Receiver drop ends the loop through failed sends; that is the
            // cooperative cancellation path.
            let head = operator.chunk(&id, created, json!({"role": "assistant"}), None);
            if tx.send_async(Ok(Value::String(sse_frame(&head)))).await.is_err() {
                return;
            }

            // Track the cumulative text so snapshot frames still yield
            // deltas.
            let mut seen = String::new();
            let mut finish_reason = "stop".to_string();
            let mut failed = false;

            while let Some(frame) = input.next().await {
                let terminal_error = match frame {
                    Ok(value) => match serde_json::from_value::<ModelOutput>(value) {
                        Ok(output) if output.has_error() => Some(json!({
                            "error": {
                                "message": output.text().unwrap_or("model error"),
                                "code": output.error_code,
                            }
                        })),
                        Ok(output) => {
                            if let Some(reason) = &output.finish_reason {
                                finish_reason = reason.clone();
                            }
                            let text = output.text().unwrap_or_default();
                            let delta = if output.incremental {
                                text.to_string()
                            } else {
                                let d = text.strip_prefix(seen.as_str()).unwrap_or(text);
                                d.to_string()
                            };
                            if output.incremental {
                                seen.push_str(&delta);
                            } else {
                                seen = text.to_string();
                            }
                            if !delta.is_empty() {
                                let chunk = operator.chunk(
                                    &id,
                                    created,
                                    json!({"content": delta}),
                                    None,
                                );
                                if tx
                                    .send_async(Ok(Value::String(sse_frame(&chunk))))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            None
                        }
                        Err(err) => Some(json!({
                            "error": {"message": err.to_string(), "code": 1}
                        })),
                    },
                    Err(err) => Some(json!({
                        "error": {"message": err.to_string(), "code": 1}
                    })),
                };

                if let Some(error_body) = terminal_error {
                    debug!("sse stream terminated by error frame");
                    let _ = tx
                        .send_async(Ok(Value::String(sse_frame(&error_body))))
                        .await;
                    failed = true;
                    break;
                }
            }

            if !failed {
                let finish = operator.chunk(&id, created, json!({}), Some(&finish_reason));
                if tx
                    .send_async(Ok(Value::String(sse_frame(&finish))))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send_async(Ok(Value::String(SSE_DONE.to_string()))).await;
        });

        Ok(Box::pin(rx.into_stream()))
    }
}
