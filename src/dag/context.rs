//! Per-execution context shared by every operator in a run.
//!
//! A [`DagContext`] carries three things: a keyed share-data map for
//! cross-operator state, the recorded JSON outputs of finished nodes, and
//! the streaming flag of the call. Sub-DAG executions receive a child
//! context that shares the parent's share-data and cancellation state but
//! keeps its own output registry.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct DagContext {
    share: Arc<RwLock<FxHashMap<String, Value>>>,
    outputs: Arc<RwLock<FxHashMap<String, Value>>>,
    cancelled: Arc<AtomicBool>,
    streaming_call: bool,
}

impl DagContext {
    pub fn new(streaming_call: bool) -> Self {
        Self {
            share: Arc::new(RwLock::new(FxHashMap::default())),
            outputs: Arc::new(RwLock::new(FxHashMap::default())),
            cancelled: Arc::new(AtomicBool::new(false)),
            streaming_call,
        }
    }

    /// Whether the surrounding call asked for a streaming response.
    pub fn streaming_call(&self) -> bool {
        self.streaming_call
    }

    /// Store a value under `key`.
    ///
    /// First writer wins: an existing entry is left untouched unless
    /// `overwrite` is set. Returns whether the value was written.
    pub fn save_to_share_data(&self, key: impl Into<String>, value: Value, overwrite: bool) -> bool {
        let key = key.into();
        let mut share = self.share.write();
        if !overwrite && share.contains_key(&key) {
            return false;
        }
        share.insert(key, value);
        true
    }

    pub fn get_from_share_data(&self, key: &str) -> Option<Value> {
        self.share.read().get(key).cloned()
    }

    pub fn remove_from_share_data(&self, key: &str) -> Option<Value> {
        self.share.write().remove(key)
    }

    /// Record the JSON output of a finished node. Stream outputs are not
    /// recorded; they have a single consumer.
    pub(crate) fn record_output(&self, name: impl Into<String>, value: Value) {
        self.outputs.write().insert(name.into(), value);
    }

    /// JSON output of an already-finished node in this execution, by name.
    pub fn node_output(&self, name: &str) -> Option<Value> {
        self.outputs.read().get(name).cloned()
    }

    /// Request cooperative cancellation of this execution and its children.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Context for a sub-DAG execution: same share-data and cancellation
    /// state, same streaming flag, fresh output registry.
    pub fn child(&self) -> DagContext {
        DagContext {
            share: Arc::clone(&self.share),
            outputs: Arc::new(RwLock::new(FxHashMap::default())),
            cancelled: Arc::clone(&self.cancelled),
            streaming_call: self.streaming_call,
        }
    }
}

impl std::fmt::Debug for DagContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagContext")
            .field("streaming_call", &self.streaming_call)
            .field("cancelled", &self.is_cancelled())
            .field("share_keys", &self.share.read().len())
            .finish()
    }
}
