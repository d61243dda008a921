//! DAG assembly and validation.
//!
//! A [`DagBuilder`] collects named operators and directed edges, then
//! [`DagBuilder::build`] validates the whole graph up front: unique names,
//! acyclicity, a single terminal node, joins with at least one input, and
//! no fan-out of stream producers. Validation failures are [`DagError`]s at
//! build time; a successfully built [`Dag`] cannot fail structurally at
//! execution time.
//!
//! Handles returned by [`DagBuilder::add_operator`] implement `>>` so
//! pipelines read left to right:
//!
//! ```ignore
//! let a = builder.add_operator("parse", OperatorKind::Map(parse))?;
//! let b = builder.add_operator("llm", OperatorKind::Map(llm))?;
//! a >> b;
//! ```

pub mod context;
pub mod executor;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ops::Shr;
use std::sync::Arc;
use thiserror::Error;

use crate::metadata::ViewMetadata;
use crate::operator::OperatorKind;
use crate::trigger::TriggerMetadata;

/// Structural errors detected while assembling or validating a DAG.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("duplicate node name: {name}")]
    DuplicateNode { name: String },

    #[error("unknown node: {name}")]
    UnknownNode { name: String },

    #[error("duplicate edge: {from} -> {to}")]
    DuplicateEdge { from: String, to: String },

    #[error("cycle detected involving node: {name}")]
    Cycle { name: String },

    #[error("dag has no nodes")]
    Empty,

    #[error("join node {name} has no upstream edges")]
    JoinWithoutInputs { name: String },

    #[error("node {name} accepts one input but has {count} upstream edges")]
    TooManyInputs { name: String, count: usize },

    #[error("input source {name} cannot have upstream edges")]
    SourceWithInputs { name: String },

    #[error("stream producer {name} fans out to more than one consumer")]
    StreamFanOut { name: String },

    #[error("dag must have exactly one terminal node, found: {names:?}")]
    AmbiguousTerminal { names: Vec<String> },
}

struct NodeSpec {
    name: String,
    kind: OperatorKind,
}

#[derive(Default)]
struct DagInner {
    nodes: Vec<NodeSpec>,
    index: FxHashMap<String, usize>,
    edges: Vec<(usize, usize)>,
}

/// Mutable DAG under construction.
#[derive(Clone, Default)]
pub struct DagBuilder {
    inner: Arc<Mutex<DagInner>>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator under a unique name and get a wiring handle.
    pub fn add_operator(
        &self,
        name: impl Into<String>,
        kind: OperatorKind,
    ) -> Result<NodeHandle, DagError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&name) {
            return Err(DagError::DuplicateNode { name });
        }
        let idx = inner.nodes.len();
        inner.index.insert(name.clone(), idx);
        inner.nodes.push(NodeSpec { name, kind });
        Ok(NodeHandle {
            inner: Arc::clone(&self.inner),
            index: idx,
        })
    }

    /// Add a directed edge between two named nodes.
    ///
    /// For joins, edge-declaration order defines the input port order.
    pub fn add_edge(&self, from: &str, to: &str) -> Result<(), DagError> {
        let mut inner = self.inner.lock();
        let from_idx = *inner.index.get(from).ok_or_else(|| DagError::UnknownNode {
            name: from.to_string(),
        })?;
        let to_idx = *inner.index.get(to).ok_or_else(|| DagError::UnknownNode {
            name: to.to_string(),
        })?;
        if inner.edges.contains(&(from_idx, to_idx)) {
            return Err(DagError::DuplicateEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        inner.edges.push((from_idx, to_idx));
        Ok(())
    }

    /// Handle for an already-registered node.
    pub fn node(&self, name: &str) -> Option<NodeHandle> {
        let inner = self.inner.lock();
        inner.index.get(name).map(|&index| NodeHandle {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    /// Validate the graph and freeze it for execution.
    pub fn build(self) -> Result<Dag, DagError> {
        let inner = {
            let mut guard = self.inner.lock();
            std::mem::take(&mut *guard)
        };
        Dag::from_inner(inner)
    }
}

/// Wiring handle for one registered node.
///
/// `a >> b` adds the edge a->b and yields `b` so chains compose;
/// `branch >> (x, y)` fans out to both targets.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<Mutex<DagInner>>,
    index: usize,
}

impl NodeHandle {
    pub fn name(&self) -> String {
        self.inner.lock().nodes[self.index].name.clone()
    }

    fn connect(&self, to: &NodeHandle) {
        let mut inner = self.inner.lock();
        let edge = (self.index, to.index);
        if !inner.edges.contains(&edge) {
            inner.edges.push(edge);
        }
    }
}

impl Shr<NodeHandle> for NodeHandle {
    type Output = NodeHandle;

    fn shr(self, rhs: NodeHandle) -> NodeHandle {
        self.connect(&rhs);
        rhs
    }
}

impl Shr<(NodeHandle, NodeHandle)> for NodeHandle {
    type Output = (NodeHandle, NodeHandle);

    fn shr(self, rhs: (NodeHandle, NodeHandle)) -> (NodeHandle, NodeHandle) {
        self.connect(&rhs.0);
        self.connect(&rhs.1);
        rhs
    }
}

impl Shr<(NodeHandle, NodeHandle, NodeHandle)> for NodeHandle {
    type Output = (NodeHandle, NodeHandle, NodeHandle);

    fn shr(
        self,
        rhs: (NodeHandle, NodeHandle, NodeHandle),
    ) -> (NodeHandle, NodeHandle, NodeHandle) {
        self.connect(&rhs.0);
        self.connect(&rhs.1);
        self.connect(&rhs.2);
        rhs
    }
}

/// A validated, immutable DAG ready for execution.
pub struct Dag {
    pub(crate) nodes: Vec<(String, OperatorKind)>,
    pub(crate) index: FxHashMap<String, usize>,
    /// Downstream adjacency, in edge-declaration order.
    pub(crate) downstream: Vec<Vec<usize>>,
    /// Upstream adjacency, in edge-declaration order (join port order).
    pub(crate) upstream: Vec<Vec<usize>>,
    /// Kahn topological order.
    pub(crate) topo: Vec<usize>,
    /// The single leaf whose output a call returns.
    pub(crate) terminal: usize,
}

impl Dag {
    fn from_inner(inner: DagInner) -> Result<Self, DagError> {
        if inner.nodes.is_empty() {
            return Err(DagError::Empty);
        }

        let n = inner.nodes.len();
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(from, to) in &inner.edges {
            downstream[from].push(to);
            upstream[to].push(from);
        }

        for (idx, spec) in inner.nodes.iter().enumerate() {
            match &spec.kind {
                OperatorKind::Join(_) => {
                    if upstream[idx].is_empty() {
                        return Err(DagError::JoinWithoutInputs {
                            name: spec.name.clone(),
                        });
                    }
                }
                OperatorKind::InputSource(_) | OperatorKind::Trigger(..) => {
                    if !upstream[idx].is_empty() {
                        return Err(DagError::SourceWithInputs {
                            name: spec.name.clone(),
                        });
                    }
                }
                OperatorKind::Map(_) | OperatorKind::Branch(_) | OperatorKind::Stream(_) => {
                    if upstream[idx].len() > 1 {
                        return Err(DagError::TooManyInputs {
                            name: spec.name.clone(),
                            count: upstream[idx].len(),
                        });
                    }
                }
            }
            if matches!(spec.kind, OperatorKind::Stream(_)) && downstream[idx].len() > 1 {
                return Err(DagError::StreamFanOut {
                    name: spec.name.clone(),
                });
            }
        }

        // Kahn's algorithm; ties broken by registration order for a
        // deterministic execution schedule. Runs before the terminal check
        // so a fully-cyclic graph (which has no leaves) reports the cycle.
        let mut indegree: Vec<usize> = upstream.iter().map(Vec::len).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut topo = Vec::with_capacity(n);
        while let Some(next) = ready.iter().copied().min() {
            ready.retain(|&i| i != next);
            topo.push(next);
            for &succ in &downstream[next] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    ready.push(succ);
                }
            }
        }
        if topo.len() != n {
            let stuck = (0..n)
                .find(|&i| indegree[i] > 0)
                .unwrap_or(0);
            return Err(DagError::Cycle {
                name: inner.nodes[stuck].name.clone(),
            });
        }

        let leaves: Vec<usize> = (0..n).filter(|&i| downstream[i].is_empty()).collect();
        if leaves.len() != 1 {
            return Err(DagError::AmbiguousTerminal {
                names: leaves
                    .iter()
                    .map(|&i| inner.nodes[i].name.clone())
                    .collect(),
            });
        }
        let terminal = leaves[0];

        Ok(Dag {
            nodes: inner
                .nodes
                .into_iter()
                .map(|spec| (spec.name, spec.kind))
                .collect(),
            index: inner.index,
            downstream,
            upstream,
            topo,
            terminal,
        })
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|(name, _)| name.as_str())
    }

    pub fn node_metadata(&self, name: &str) -> Option<ViewMetadata> {
        self.index.get(name).map(|&i| self.nodes[i].1.metadata())
    }

    /// Declarative endpoint records of all trigger nodes, for an external
    /// HTTP host to mount.
    pub fn triggers(&self) -> Vec<(&str, &TriggerMetadata)> {
        self.nodes
            .iter()
            .filter_map(|(name, kind)| {
                kind.trigger_metadata().map(|meta| (name.as_str(), meta))
            })
            .collect()
    }
}

impl std::fmt::Debug for Dag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dag")
            .field("nodes", &self.nodes.len())
            .field("terminal", &self.nodes[self.terminal].0)
            .finish()
    }
}
