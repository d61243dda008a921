//! Core value types flowing through an operator DAG.
//!
//! Every edge in a DAG carries a [`TaskValue`]: either a JSON payload, an
//! async stream of JSON frames, or the `Empty` sentinel used to mark data
//! from a skipped branch. `Empty` is distinct from `Json(Value::Null)`;
//! use [`is_empty_data`] when a join needs to tell them apart.

use futures_util::stream::BoxStream;
use serde_json::Value;
use std::fmt;

use crate::operator::OperatorError;

/// Async sequence of JSON frames produced by streaming operators.
pub type TaskStream = BoxStream<'static, Result<Value, OperatorError>>;

/// A value travelling along a DAG edge.
///
/// `TaskValue` is deliberately not `Clone`: streams have a single consumer.
/// The executor clones the inner [`Value`] when a JSON output fans out to
/// several downstream operators and rejects fan-out of streams at runtime.
pub enum TaskValue {
    /// A materialized JSON payload.
    Json(Value),
    /// An async stream of JSON frames.
    Stream(TaskStream),
    /// Sentinel delivered on ports whose upstream subtree was skipped by a
    /// branch decision.
    Empty,
}

impl TaskValue {
    /// Wrap a JSON value.
    pub fn json(value: impl Into<Value>) -> Self {
        TaskValue::Json(value.into())
    }

    /// Returns `true` when this is the skip sentinel.
    #[must_use]
    pub fn is_empty_data(&self) -> bool {
        matches!(self, TaskValue::Empty)
    }

    /// Returns `true` when this value is a stream.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, TaskValue::Stream(_))
    }

    /// Borrow the JSON payload, if any.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            TaskValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Consume the value and return the JSON payload.
    ///
    /// # Errors
    ///
    /// Fails with [`OperatorError::Input`] when the value is a stream or the
    /// skip sentinel.
    pub fn into_json(self) -> Result<Value, OperatorError> {
        match self {
            TaskValue::Json(v) => Ok(v),
            TaskValue::Stream(_) => Err(OperatorError::Input {
                message: "expected a JSON value, got a stream".to_string(),
            }),
            TaskValue::Empty => Err(OperatorError::Input {
                message: "expected a JSON value, got empty-data".to_string(),
            }),
        }
    }

    /// Consume the value and return the stream payload.
    ///
    /// # Errors
    ///
    /// Fails with [`OperatorError::Input`] when the value is not a stream.
    pub fn into_stream(self) -> Result<TaskStream, OperatorError> {
        match self {
            TaskValue::Stream(s) => Ok(s),
            TaskValue::Json(_) => Err(OperatorError::Input {
                message: "expected a stream, got a JSON value".to_string(),
            }),
            TaskValue::Empty => Err(OperatorError::Input {
                message: "expected a stream, got empty-data".to_string(),
            }),
        }
    }

    /// Deserialize the JSON payload into a typed value.
    pub fn parse<T: serde::de::DeserializeOwned>(self) -> Result<T, OperatorError> {
        let value = self.into_json()?;
        serde_json::from_value(value).map_err(OperatorError::Serde)
    }
}

impl From<Value> for TaskValue {
    fn from(value: Value) -> Self {
        TaskValue::Json(value)
    }
}

impl fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskValue::Json(v) => f.debug_tuple("Json").field(v).finish(),
            TaskValue::Stream(_) => f.write_str("Stream(..)"),
            TaskValue::Empty => f.write_str("Empty"),
        }
    }
}

/// Distinguish the skip sentinel from a legitimate `null` payload.
#[must_use]
pub fn is_empty_data(value: &TaskValue) -> bool {
    value.is_empty_data()
}
