//! Stream frame conversions.
//!
//! Model providers disagree on whether stream frames carry deltas or
//! cumulative snapshots. The converters here normalize a stream of
//! [`ModelOutput`] JSON frames in either direction; each frame's
//! `incremental` flag records which convention it follows. Error frames
//! (non-zero `error_code`) pass through untouched in both directions.

pub mod sse;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use serde_json::Value;
use thiserror::Error;

use crate::dag::context::DagContext;
use crate::metadata::{OperatorCategory, ViewMetadata};
use crate::model::{MediaContent, ModelOutput};
use crate::operator::{OperatorBase, OperatorError, StreamOperator};
use crate::types::TaskStream;

/// Errors raised while decoding or reshaping stream frames.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed stream frame: {message}")]
    Malformed { message: String },

    #[error("stream consumer went away")]
    ConsumerGone,
}

fn decode_frame(value: Value) -> Result<ModelOutput, OperatorError> {
    serde_json::from_value(value).map_err(|err| {
        StreamError::Malformed {
            message: err.to_string(),
        }
        .into()
    })
}

fn encode_frame(output: &ModelOutput) -> Result<Value, OperatorError> {
    serde_json::to_value(output).map_err(OperatorError::Serde)
}

#[derive(Default)]
struct Accumulated {
    text: String,
    thinking: String,
}

impl Accumulated {
    fn snapshot(&self, template: &ModelOutput) -> ModelOutput {
        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(MediaContent::thinking(self.thinking.clone()));
        }
        content.push(MediaContent::text(self.text.clone()));
        ModelOutput {
            content,
            error_code: template.error_code,
            incremental: false,
            finish_reason: template.finish_reason.clone(),
            usage: template.usage,
            metrics: template.metrics.clone(),
        }
    }
}

/// Turn a stream of delta frames into cumulative snapshots.
///
/// Frames already marked cumulative reset the accumulator to their content
/// and pass through.
pub fn to_cumulative(input: TaskStream) -> TaskStream {
    let folded = input.scan(Accumulated::default(), |acc, frame| {
        let out = frame.and_then(decode_frame).and_then(|output| {
            if output.has_error() {
                return encode_frame(&output);
            }
            if output.incremental {
                if let Some(delta) = output.text() {
                    acc.text.push_str(delta);
                }
                if let Some(delta) = output.thinking() {
                    acc.thinking.push_str(delta);
                }
            } else {
                acc.text = output.text().unwrap_or_default().to_string();
                acc.thinking = output.thinking().unwrap_or_default().to_string();
            }
            encode_frame(&acc.snapshot(&output))
        });
        futures_util::future::ready(Some(out))
    });
    Box::pin(folded)
}

/// Turn a stream of cumulative snapshots into delta frames.
///
/// Frames already marked incremental pass through. A snapshot that does not
/// extend its predecessor is emitted whole.
pub fn to_incremental(input: TaskStream) -> TaskStream {
    let folded = input.scan(Accumulated::default(), |acc, frame| {
        let out = frame.and_then(decode_frame).and_then(|output| {
            if output.has_error() || output.incremental {
                return encode_frame(&output);
            }
            let text = output.text().unwrap_or_default();
            let thinking = output.thinking().unwrap_or_default();
            let text_delta = text.strip_prefix(acc.text.as_str()).unwrap_or(text);
            let thinking_delta = thinking
                .strip_prefix(acc.thinking.as_str())
                .unwrap_or(thinking);
            acc.text = text.to_string();
            acc.thinking = thinking.to_string();

            let mut content = Vec::new();
            if !thinking_delta.is_empty() {
                content.push(MediaContent::thinking(thinking_delta));
            }
            content.push(MediaContent::text(text_delta));
            encode_frame(&ModelOutput {
                content,
                error_code: output.error_code,
                incremental: true,
                finish_reason: output.finish_reason.clone(),
                usage: output.usage,
                metrics: output.metrics.clone(),
            })
        });
        futures_util::future::ready(Some(out))
    });
    Box::pin(folded)
}

/// [`StreamOperator`] wrapper over [`to_cumulative`].
pub struct CumulativeTransformOperator;

#[async_trait]
impl OperatorBase for CumulativeTransformOperator {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("Cumulative Stream", "cumulative_transform")
            .category(OperatorCategory::Output)
            .build()
    }
}

#[async_trait]
impl StreamOperator for CumulativeTransformOperator {
    async fn transform(
        &self,
        input: TaskStream,
        _ctx: &DagContext,
    ) -> Result<TaskStream, OperatorError> {
        Ok(to_cumulative(input))
    }
}

/// [`StreamOperator`] wrapper over [`to_incremental`].
pub struct IncrementalTransformOperator;

#[async_trait]
impl OperatorBase for IncrementalTransformOperator {
    fn metadata(&self) -> ViewMetadata {
        ViewMetadata::builder("Incremental Stream", "incremental_transform")
            .category(OperatorCategory::Output)
            .build()
    }

    fn incremental_output(&self) -> bool {
        true
    }
}

#[async_trait]
impl StreamOperator for IncrementalTransformOperator {
    async fn transform(
        &self,
        input: TaskStream,
        _ctx: &DagContext,
    ) -> Result<TaskStream, OperatorError> {
        Ok(to_incremental(input))
    }
}
