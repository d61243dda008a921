//! Operator capability traits and the runtime error type.
//!
//! Operators are small async units wired into a DAG. Rather than one trait
//! with many optional methods, each execution shape gets its own trait
//! ([`MapOperator`], [`JoinOperator`], [`BranchOperator`],
//! [`InputSourceOperator`], [`StreamOperator`]) layered over the shared
//! [`OperatorBase`]. The executor stores them behind [`OperatorKind`] so a
//! DAG can mix shapes freely while the builder still knows, statically per
//! node, which calling convention applies.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::dag::context::DagContext;
use crate::metadata::ViewMetadata;
use crate::model::client::ModelError;
use crate::rag::store::StorageError;
use crate::trigger::TriggerMetadata;
use crate::types::{TaskStream, TaskValue};

/// Error raised by operator execution.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Malformed or mistyped input payload.
    #[error("invalid operator input: {message}")]
    Input { message: String },

    /// An expected input or context entry was absent.
    #[error("missing input: {what}")]
    MissingInput { what: String },

    /// Branch routing produced an unusable decision.
    #[error("branch routing failed: {message}")]
    Branch { message: String },

    /// Model-layer failure surfaced through an operator.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Storage-layer failure surfaced through an operator.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Stream decoding or reshaping failure.
    #[error(transparent)]
    Stream(#[from] crate::streaming::StreamError),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    /// The consumer went away; the execution is cooperatively cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// Invariant violation inside the runtime itself.
    #[error("internal operator error: {0}")]
    Internal(String),
}

/// Behaviour shared by every operator regardless of execution shape.
#[async_trait]
pub trait OperatorBase: Send + Sync {
    /// Introspection record for this operator.
    fn metadata(&self) -> ViewMetadata;

    /// Whether stream frames emitted by this operator are deltas rather
    /// than cumulative snapshots.
    fn incremental_output(&self) -> bool {
        false
    }

    /// End-of-execution hook. Invoked once per execution, in reverse start
    /// order, after the terminal operator finished or the run aborted.
    async fn after_dag_end(&self, _ctx: &DagContext) -> Result<(), OperatorError> {
        Ok(())
    }
}

/// One input, one output.
#[async_trait]
pub trait MapOperator: OperatorBase {
    async fn map(&self, input: TaskValue, ctx: &DagContext) -> Result<TaskValue, OperatorError>;
}

/// Combines all upstream outputs into one value.
///
/// Inputs arrive in the edge-declaration order of the DAG. Skipped upstream
/// ports deliver [`TaskValue::Empty`] when the join still fires.
#[async_trait]
pub trait JoinOperator: OperatorBase {
    async fn combine(
        &self,
        inputs: Vec<TaskValue>,
        ctx: &DagContext,
    ) -> Result<TaskValue, OperatorError>;

    /// When `false`, the join fires as long as at least one upstream is
    /// live; skipped ports show up as empty-data. When `true`, the join is
    /// skipped together with its skipped upstreams.
    fn can_skip_in_branch(&self) -> bool {
        true
    }
}

/// Chooses which downstream subtrees run.
#[async_trait]
pub trait BranchOperator: OperatorBase {
    /// Returns a decision per downstream node name. Exactly one entry must
    /// be `true`; the executor rejects anything else.
    async fn route(
        &self,
        input: TaskValue,
        ctx: &DagContext,
    ) -> Result<FxHashMap<String, bool>, OperatorError>;
}

/// Produces the initial value of an execution from the caller's call data.
#[async_trait]
pub trait InputSourceOperator: OperatorBase {
    async fn produce(
        &self,
        call_data: TaskValue,
        ctx: &DagContext,
    ) -> Result<TaskValue, OperatorError>;
}

/// Transforms a stream of frames into another stream of frames.
#[async_trait]
pub trait StreamOperator: OperatorBase {
    async fn transform(
        &self,
        input: TaskStream,
        ctx: &DagContext,
    ) -> Result<TaskStream, OperatorError>;
}

/// An operator as the DAG stores it: the execution shape plus the shared
/// handle. `Trigger` is an input source annotated with the declarative
/// endpoint record an external HTTP host can serve it from.
#[derive(Clone)]
pub enum OperatorKind {
    Map(Arc<dyn MapOperator>),
    Join(Arc<dyn JoinOperator>),
    Branch(Arc<dyn BranchOperator>),
    InputSource(Arc<dyn InputSourceOperator>),
    Stream(Arc<dyn StreamOperator>),
    Trigger(Arc<dyn InputSourceOperator>, TriggerMetadata),
}

impl OperatorKind {
    pub fn metadata(&self) -> ViewMetadata {
        match self {
            OperatorKind::Map(op) => op.metadata(),
            OperatorKind::Join(op) => op.metadata(),
            OperatorKind::Branch(op) => op.metadata(),
            OperatorKind::InputSource(op) => op.metadata(),
            OperatorKind::Stream(op) => op.metadata(),
            OperatorKind::Trigger(op, _) => op.metadata(),
        }
    }

    pub fn incremental_output(&self) -> bool {
        match self {
            OperatorKind::Map(op) => op.incremental_output(),
            OperatorKind::Join(op) => op.incremental_output(),
            OperatorKind::Branch(op) => op.incremental_output(),
            OperatorKind::InputSource(op) => op.incremental_output(),
            OperatorKind::Stream(op) => op.incremental_output(),
            OperatorKind::Trigger(op, _) => op.incremental_output(),
        }
    }

    pub async fn after_dag_end(&self, ctx: &DagContext) -> Result<(), OperatorError> {
        match self {
            OperatorKind::Map(op) => op.after_dag_end(ctx).await,
            OperatorKind::Join(op) => op.after_dag_end(ctx).await,
            OperatorKind::Branch(op) => op.after_dag_end(ctx).await,
            OperatorKind::InputSource(op) => op.after_dag_end(ctx).await,
            OperatorKind::Stream(op) => op.after_dag_end(ctx).await,
            OperatorKind::Trigger(op, _) => op.after_dag_end(ctx).await,
        }
    }

    /// Whether this node consumes an upstream value at all.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            OperatorKind::InputSource(_) | OperatorKind::Trigger(..)
        )
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            OperatorKind::Map(_) => "map",
            OperatorKind::Join(_) => "join",
            OperatorKind::Branch(_) => "branch",
            OperatorKind::InputSource(_) => "input_source",
            OperatorKind::Stream(_) => "stream",
            OperatorKind::Trigger(..) => "trigger",
        }
    }

    pub fn trigger_metadata(&self) -> Option<&TriggerMetadata> {
        match self {
            OperatorKind::Trigger(_, meta) => Some(meta),
            _ => None,
        }
    }
}

impl std::fmt::Debug for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorKind")
            .field("shape", &self.shape_name())
            .field("name", &self.metadata().name)
            .finish()
    }
}
