//! Index store contract and shared storage plumbing.
//!
//! An [`IndexStore`] persists chunks and answers similarity or full-text
//! queries over them. The trait is deliberately narrow so vector databases,
//! keyword engines, and in-memory test doubles all fit behind it.
//! [`IndexStore::load_with_limit`] adds bounded-concurrency batch loading
//! on top of any implementation while preserving input order.

pub mod memory;

use async_trait::async_trait;
use futures_util::stream::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::model::client::ModelError;
use crate::rag::chunk::Chunk;

/// Errors raised by index stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("operation not supported by this store: {operation}")]
    Unsupported { operation: String },

    /// Failure worth retrying: timeouts, transient backend hiccups.
    #[error("transient storage failure: {message}")]
    Transient { message: String },

    #[error("invalid storage request: {message}")]
    Invalid { message: String },

    /// Embedding or other model-side failure during a store operation.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Retry `op` up to `max_attempts` times, but only on
/// [`StorageError::Transient`]. Other errors surface immediately.
pub async fn retry_transient<T, F, Fut>(max_attempts: usize, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    let attempts = max_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StorageError::Transient { message }) => {
                warn!(attempt, max_attempts = attempts, %message, "transient storage failure");
                last = Some(StorageError::Transient { message });
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(StorageError::Transient {
        message: "retry loop exhausted".to_string(),
    }))
}

/// Comparison operator of one metadata condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

/// One metadata predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub key: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterCondition {
    pub fn eq(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    fn matches(&self, metadata_value: Option<&Value>) -> bool {
        let Some(actual) = metadata_value else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|list| list.contains(actual)),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                match (actual.as_f64(), self.value.as_f64()) {
                    (Some(a), Some(b)) => match self.op {
                        FilterOp::Gt => a > b,
                        FilterOp::Gte => a >= b,
                        FilterOp::Lt => a < b,
                        FilterOp::Lte => a <= b,
                        _ => false,
                    },
                    _ => match (actual.as_str(), self.value.as_str()) {
                        (Some(a), Some(b)) => match self.op {
                            FilterOp::Gt => a > b,
                            FilterOp::Gte => a >= b,
                            FilterOp::Lt => a < b,
                            FilterOp::Lte => a <= b,
                            _ => false,
                        },
                        _ => false,
                    },
                }
            }
        }
    }
}

/// How conditions of a filter combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCombinator {
    #[default]
    And,
    Or,
}

/// Conjunction or disjunction of metadata conditions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub conditions: Vec<FilterCondition>,
    #[serde(default)]
    pub combinator: FilterCombinator,
}

impl MetadataFilter {
    pub fn all(conditions: Vec<FilterCondition>) -> Self {
        Self {
            conditions,
            combinator: FilterCombinator::And,
        }
    }

    pub fn any(conditions: Vec<FilterCondition>) -> Self {
        Self {
            conditions,
            combinator: FilterCombinator::Or,
        }
    }

    pub fn matches(&self, metadata: &rustc_hash::FxHashMap<String, Value>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let mut check = self
            .conditions
            .iter()
            .map(|c| c.matches(metadata.get(&c.key)));
        match self.combinator {
            FilterCombinator::And => check.all(|m| m),
            FilterCombinator::Or => check.any(|m| m),
        }
    }
}

/// Store-level configuration shared by implementations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexStoreConfig {
    /// Collection name.
    pub name: String,
    /// Batch size for [`IndexStore::load_with_limit`].
    #[serde(default = "default_max_chunks_once_load")]
    pub max_chunks_once_load: usize,
    /// Concurrent batch loads in flight.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Default result count for searches.
    #[serde(default = "default_topk")]
    pub topk: usize,
}

fn default_max_chunks_once_load() -> usize {
    10
}

fn default_max_threads() -> usize {
    1
}

fn default_topk() -> usize {
    4
}

impl IndexStoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_chunks_once_load: default_max_chunks_once_load(),
            max_threads: default_max_threads(),
            topk: default_topk(),
        }
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Collection name of this store.
    fn name(&self) -> &str;

    /// Persist chunks, returning their ids in input order. Reloading a
    /// chunk id replaces the stored copy.
    async fn load(&self, chunks: Vec<Chunk>) -> Result<Vec<String>, StorageError>;

    /// Similarity search with scores in [0, 1], best first. Results below
    /// `score_threshold` are dropped. Ties keep insertion order.
    async fn similar_search_with_scores(
        &self,
        text: &str,
        topk: usize,
        score_threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, StorageError>;

    /// Similarity search without a threshold or filter.
    async fn similar_search(&self, text: &str, topk: usize) -> Result<Vec<Chunk>, StorageError> {
        self.similar_search_with_scores(text, topk, None, None).await
    }

    /// Keyword search. Stores without a full-text index return
    /// [`StorageError::Unsupported`].
    async fn full_text_search(&self, _text: &str, _topk: usize) -> Result<Vec<Chunk>, StorageError> {
        Err(StorageError::Unsupported {
            operation: "full_text_search".to_string(),
        })
    }

    /// Delete by chunk id, returning how many were removed.
    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize, StorageError>;

    /// Drop the whole collection, returning its name.
    async fn drop_collection(&self) -> Result<String, StorageError>;

    /// Remove every row but keep the collection itself, returning the
    /// removed chunk ids.
    async fn truncate(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Unsupported {
            operation: "truncate".to_string(),
        })
    }

    /// Whether a collection with this name exists behind the store.
    async fn vector_name_exists(&self, _name: &str) -> Result<bool, StorageError> {
        Err(StorageError::Unsupported {
            operation: "vector_name_exists".to_string(),
        })
    }

    /// Load in batches of `max_chunks_once_load`, at most `max_threads`
    /// batches in flight. Returned ids keep input order regardless of
    /// which batch finished first.
    async fn load_with_limit(
        &self,
        chunks: Vec<Chunk>,
        max_chunks_once_load: usize,
        max_threads: usize,
    ) -> Result<Vec<String>, StorageError> {
        let batch = max_chunks_once_load.max(1);
        let groups: Vec<Vec<Chunk>> = chunks
            .chunks(batch)
            .map(|group| group.to_vec())
            .collect();
        let ids: Vec<Vec<String>> = futures_util::stream::iter(groups)
            .map(|group| self.load(group))
            .buffered(max_threads.max(1))
            .try_collect()
            .await?;
        Ok(ids.into_iter().flatten().collect())
    }
}
