//! Single-pass topological execution of a validated [`Dag`].
//!
//! Each call walks the topological order once. Operators run one at a time
//! on the caller's task; concurrency comes from awaiting inside operators,
//! not from parallel node scheduling. Branch decisions mark unchosen
//! subtrees skipped; joins that opt out of skipping fire with empty-data on
//! their dead ports. When the terminal operator finishes (or the run
//! aborts), every started operator's `after_dag_end` hook runs in reverse
//! start order.

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::dag::context::DagContext;
use crate::dag::Dag;
use crate::metadata::ViewMetadata;
use crate::operator::{MapOperator, OperatorBase, OperatorError, OperatorKind};
use crate::types::{TaskStream, TaskValue};

/// Per-node result slot during one execution pass.
enum Slot {
    Json(Value),
    /// Streams have a single consumer; `None` after it was taken.
    Stream(Option<TaskStream>),
    Skipped,
}

impl Slot {
    fn is_skipped(&self) -> bool {
        matches!(self, Slot::Skipped)
    }

    /// Borrow-or-take the slot as an input value for a downstream operator.
    fn take_input(&mut self, producer: &str) -> Result<TaskValue, OperatorError> {
        match self {
            Slot::Json(v) => Ok(TaskValue::Json(v.clone())),
            Slot::Stream(s) => match s.take() {
                Some(stream) => Ok(TaskValue::Stream(stream)),
                None => Err(OperatorError::Internal(format!(
                    "stream output of {producer} consumed twice"
                ))),
            },
            Slot::Skipped => Ok(TaskValue::Empty),
        }
    }
}

/// Deferred `after_dag_end` hooks of a finished sub-DAG execution.
///
/// The parent operator that ran the sub-DAG holds these and fires them from
/// its own end hook, so a nested execution's hooks run exactly once, when
/// the outer execution winds down.
pub struct PendingHooks {
    dag: Arc<Dag>,
    started: Vec<usize>,
    ctx: DagContext,
}

impl PendingHooks {
    pub async fn run(self) -> Result<(), OperatorError> {
        self.dag.run_hooks(&self.started, &self.ctx).await
    }
}

/// Wind-down state travelling with a streaming call's output.
///
/// When the stream runs dry, [`Winddown::complete`] fires the end hooks
/// inline. When the consumer drops the stream before that, `Drop` cancels
/// the execution and fires the hooks on the runtime instead, since hooks
/// are async and `Drop` cannot await.
struct Winddown {
    dag: Arc<Dag>,
    started: Vec<usize>,
    ctx: DagContext,
    delivered: bool,
}

impl Winddown {
    async fn complete(&mut self) {
        self.delivered = true;
        if let Err(err) = self.dag.run_hooks(&self.started, &self.ctx).await {
            warn!(error = %err, "after_dag_end hook failed after stream completion");
        }
    }
}

impl Drop for Winddown {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        self.ctx.cancel();
        let dag = Arc::clone(&self.dag);
        let started = std::mem::take(&mut self.started);
        let ctx = self.ctx.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = dag.run_hooks(&started, &ctx).await {
                    warn!(error = %err, "after_dag_end hook failed after stream consumer disconnected");
                }
            });
        }
    }
}

impl Dag {
    /// Execute with a JSON payload and return the terminal JSON output.
    #[instrument(skip(self, call_data), fields(nodes = self.nodes.len()))]
    pub async fn call(&self, call_data: Value) -> Result<Value, OperatorError> {
        let ctx = DagContext::new(false);
        let (result, started) = self.execute(TaskValue::Json(call_data), &ctx).await;
        let hook_result = self.run_hooks(&started, &ctx).await;
        let value = result?;
        hook_result?;
        value.into_json()
    }

    /// Execute with a JSON payload and return the terminal output as a
    /// stream of frames. A JSON terminal output becomes a one-frame stream.
    ///
    /// End hooks run after the returned stream is fully consumed; hook
    /// failures at that point are logged, not surfaced, since the response
    /// has already been delivered. A consumer that drops the stream early
    /// cancels the execution, and the hooks run on a background task.
    #[instrument(skip(self, call_data), fields(nodes = self.nodes.len()))]
    pub async fn call_streaming(
        self: &Arc<Self>,
        call_data: Value,
    ) -> Result<TaskStream, OperatorError> {
        let ctx = DagContext::new(true);
        let (result, started) = self.execute(TaskValue::Json(call_data), &ctx).await;
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                if let Err(hook_err) = self.run_hooks(&started, &ctx).await {
                    warn!(error = %hook_err, "after_dag_end hook failed during abort");
                }
                return Err(err);
            }
        };

        let body: TaskStream = match value {
            TaskValue::Stream(s) => s,
            TaskValue::Json(v) => Box::pin(futures_util::stream::once(async move { Ok(v) })),
            TaskValue::Empty => Box::pin(futures_util::stream::empty()),
        };

        let wind = Winddown {
            dag: Arc::clone(self),
            started,
            ctx,
            delivered: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(
            (body, wind),
            |(mut body, mut wind)| async move {
                match body.next().await {
                    Some(frame) => Some((frame, (body, wind))),
                    None => {
                        wind.complete().await;
                        None
                    }
                }
            },
        )))
    }

    /// Execute as a sub-DAG inside a parent execution.
    ///
    /// The child context shares the parent's share-data, cancellation state,
    /// and streaming flag. End hooks are not run here; the returned
    /// [`PendingHooks`] must be fired exactly once when the parent execution
    /// finishes. On failure the child's hooks have already run.
    pub async fn call_with_context(
        self: &Arc<Self>,
        call_data: TaskValue,
        parent_ctx: &DagContext,
    ) -> Result<(TaskValue, PendingHooks), OperatorError> {
        let ctx = parent_ctx.child();
        let (result, started) = self.execute(call_data, &ctx).await;
        match result {
            Ok(value) => Ok((
                value,
                PendingHooks {
                    dag: Arc::clone(self),
                    started,
                    ctx,
                },
            )),
            Err(err) => {
                if let Err(hook_err) = self.run_hooks(&started, &ctx).await {
                    warn!(error = %hook_err, "after_dag_end hook failed during sub-dag abort");
                }
                Err(err)
            }
        }
    }

    /// One pass over topological order. Returns the terminal value and the
    /// list of started node indices in start order.
    async fn execute(
        &self,
        call_data: TaskValue,
        ctx: &DagContext,
    ) -> (Result<TaskValue, OperatorError>, Vec<usize>) {
        let mut started = Vec::new();
        let result = self
            .execute_inner(call_data, ctx, &mut started)
            .await;
        (result, started)
    }

    async fn execute_inner(
        &self,
        call_data: TaskValue,
        ctx: &DagContext,
        started: &mut Vec<usize>,
    ) -> Result<TaskValue, OperatorError> {
        let n = self.nodes.len();
        let mut slots: Vec<Option<Slot>> = (0..n).map(|_| None).collect();
        // Targets a branch decided against.
        let mut unchosen = vec![false; n];
        // Call data is consumed by the first root; further JSON roots get a
        // clone, further stream roots are a runtime error.
        let mut call_data = Some(call_data);

        for &idx in &self.topo {
            if ctx.is_cancelled() {
                return Err(OperatorError::Cancelled);
            }

            let (name, kind) = &self.nodes[idx];
            let ups = &self.upstream[idx];

            let skipped = if unchosen[idx] {
                true
            } else if ups.is_empty() {
                false
            } else if let OperatorKind::Join(join) = kind {
                let any_skipped = ups
                    .iter()
                    .any(|&u| slots[u].as_ref().is_some_and(Slot::is_skipped));
                let all_skipped = ups
                    .iter()
                    .all(|&u| slots[u].as_ref().is_some_and(Slot::is_skipped));
                all_skipped || (any_skipped && join.can_skip_in_branch())
            } else {
                // Non-join consumers have exactly one upstream.
                slots[ups[0]].as_ref().is_some_and(Slot::is_skipped)
            };

            if skipped {
                slots[idx] = Some(Slot::Skipped);
                continue;
            }

            started.push(idx);
            let output = match kind {
                OperatorKind::Map(op) => {
                    let input = self.single_input(&mut slots, &mut call_data, idx)?;
                    op.map(input, ctx).await?
                }
                OperatorKind::Branch(op) => {
                    let input = self.single_input(&mut slots, &mut call_data, idx)?;
                    let input_json = input.into_json().map_err(|_| OperatorError::Branch {
                        message: format!("branch {name} requires a JSON input"),
                    })?;
                    let decision = op.route(TaskValue::Json(input_json.clone()), ctx).await?;
                    self.apply_branch_decision(idx, name, &decision, &mut unchosen)?;
                    // A branch passes its input through to the chosen child.
                    TaskValue::Json(input_json)
                }
                OperatorKind::Join(op) => {
                    let mut inputs = Vec::with_capacity(ups.len());
                    for &u in ups {
                        let slot = slots[u]
                            .as_mut()
                            .ok_or_else(|| OperatorError::Internal(format!(
                                "upstream of {name} not yet executed"
                            )))?;
                        inputs.push(slot.take_input(&self.nodes[u].0)?);
                    }
                    op.combine(inputs, ctx).await?
                }
                OperatorKind::InputSource(op) | OperatorKind::Trigger(op, _) => {
                    let data = self.root_call_data(&mut call_data)?;
                    op.produce(data, ctx).await?
                }
                OperatorKind::Stream(op) => {
                    let input = self.single_input(&mut slots, &mut call_data, idx)?;
                    let stream = input.into_stream()?;
                    TaskValue::Stream(op.transform(stream, ctx).await?)
                }
            };

            slots[idx] = Some(match output {
                TaskValue::Json(v) => {
                    ctx.record_output(name.clone(), v.clone());
                    Slot::Json(v)
                }
                TaskValue::Stream(s) => Slot::Stream(Some(s)),
                TaskValue::Empty => Slot::Json(Value::Null),
            });
        }

        match slots[self.terminal].as_mut() {
            Some(slot) if slot.is_skipped() => Ok(TaskValue::Empty),
            Some(slot) => slot.take_input(&self.nodes[self.terminal].0),
            None => Err(OperatorError::Internal(
                "terminal node never scheduled".to_string(),
            )),
        }
    }

    fn single_input(
        &self,
        slots: &mut [Option<Slot>],
        call_data: &mut Option<TaskValue>,
        idx: usize,
    ) -> Result<TaskValue, OperatorError> {
        match self.upstream[idx].first() {
            Some(&u) => {
                let slot = slots[u].as_mut().ok_or_else(|| {
                    OperatorError::Internal(format!(
                        "upstream of {} not yet executed",
                        self.nodes[idx].0
                    ))
                })?;
                slot.take_input(&self.nodes[u].0)
            }
            None => self.root_call_data(call_data),
        }
    }

    /// Hand the call data to a root node. JSON call data fans out by clone;
    /// stream call data has a single consumer.
    fn root_call_data(
        &self,
        call_data: &mut Option<TaskValue>,
    ) -> Result<TaskValue, OperatorError> {
        match call_data.take() {
            Some(TaskValue::Json(v)) => {
                *call_data = Some(TaskValue::Json(v.clone()));
                Ok(TaskValue::Json(v))
            }
            Some(other) => Ok(other),
            None => Err(OperatorError::Input {
                message: "stream call data cannot fan out to multiple roots".to_string(),
            }),
        }
    }

    fn apply_branch_decision(
        &self,
        idx: usize,
        name: &str,
        decision: &rustc_hash::FxHashMap<String, bool>,
        unchosen: &mut [bool],
    ) -> Result<(), OperatorError> {
        let chosen: Vec<&String> = decision.iter().filter(|(_, &v)| v).map(|(k, _)| k).collect();
        if chosen.len() != 1 {
            return Err(OperatorError::Branch {
                message: format!(
                    "branch {name} must choose exactly one target, chose {}",
                    chosen.len()
                ),
            });
        }
        let downstream_names: Vec<&str> = self.downstream[idx]
            .iter()
            .map(|&d| self.nodes[d].0.as_str())
            .collect();
        for key in decision.keys() {
            if !downstream_names.contains(&key.as_str()) {
                return Err(OperatorError::Branch {
                    message: format!("branch {name} routed to non-adjacent node {key}"),
                });
            }
        }
        for &d in &self.downstream[idx] {
            let target = self.nodes[d].0.as_str();
            if !decision.get(target).copied().unwrap_or(false) {
                unchosen[d] = true;
            }
        }
        Ok(())
    }

    /// Run `after_dag_end` hooks in reverse start order. Every hook runs;
    /// the first failure is surfaced after the rest completed.
    pub(crate) async fn run_hooks(
        &self,
        started: &[usize],
        ctx: &DagContext,
    ) -> Result<(), OperatorError> {
        let mut first_err = None;
        for &idx in started.iter().rev() {
            let (name, kind) = &self.nodes[idx];
            if let Err(err) = kind.after_dag_end(ctx).await {
                warn!(node = %name, error = %err, "after_dag_end hook failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Runs a nested DAG as a single map step of the parent.
///
/// The child shares the parent's context through [`DagContext::child`]; its
/// end hooks are deferred and fired from this operator's own end hook, so
/// they run exactly once, when the parent execution finishes.
pub struct SubDagOperator {
    dag: Arc<Dag>,
    meta: ViewMetadata,
    pending: Mutex<Vec<PendingHooks>>,
}

impl SubDagOperator {
    pub fn new(dag: Arc<Dag>, meta: ViewMetadata) -> Self {
        Self {
            dag,
            meta,
            pending: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OperatorBase for SubDagOperator {
    fn metadata(&self) -> ViewMetadata {
        self.meta.clone()
    }

    async fn after_dag_end(&self, _ctx: &DagContext) -> Result<(), OperatorError> {
        let mut pending: Vec<PendingHooks> = std::mem::take(&mut *self.pending.lock());
        let mut first_err = None;
        while let Some(hooks) = pending.pop() {
            if let Err(err) = hooks.run().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MapOperator for SubDagOperator {
    async fn map(&self, input: TaskValue, ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        let (value, hooks) = self.dag.call_with_context(input, ctx).await?;
        self.pending.lock().push(hooks);
        Ok(value)
    }
}
