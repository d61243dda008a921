//! Retrievers over index stores.
//!
//! [`EmbeddingRetriever`] answers from a vector store, optionally fanning
//! out over rewritten queries; [`KeywordRetriever`] answers from a
//! full-text store; [`HybridRetriever`] runs several retrievers
//! concurrently and fuses their lists through a [`Ranker`].

use async_trait::async_trait;
use futures_util::future::{join_all, try_join_all};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::model::client::ModelError;
use crate::operator::OperatorError;
use crate::rag::chunk::Chunk;
use crate::rag::rerank::{DefaultRanker, QueryRewriter, Ranker};
use crate::rag::store::{retry_transient, IndexStore, MetadataFilter, StorageError};

/// Attempts per store search before a transient failure surfaces.
const SEARCH_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RetrieverError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl From<RetrieverError> for OperatorError {
    fn from(err: RetrieverError) -> Self {
        match err {
            RetrieverError::Storage(e) => OperatorError::Storage(e),
            RetrieverError::Model(e) => OperatorError::Model(e),
        }
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve scored chunks for one query, best first.
    async fn retrieve_with_scores(
        &self,
        query: &str,
        topk: usize,
        score_threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, RetrieverError>;

    /// Retrieve without threshold or filter.
    async fn retrieve(&self, query: &str, topk: usize) -> Result<Vec<Chunk>, RetrieverError> {
        self.retrieve_with_scores(query, topk, None, None).await
    }

    /// Concurrent fan-out over several queries, one result list per query
    /// in input order.
    async fn retrieve_multi(
        &self,
        queries: &[String],
        topk: usize,
        score_threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Vec<Chunk>>, RetrieverError> {
        try_join_all(
            queries
                .iter()
                .map(|q| self.retrieve_with_scores(q, topk, score_threshold, filter)),
        )
        .await
    }
}

/// Vector-store retriever with optional LLM query rewriting.
pub struct EmbeddingRetriever {
    store: Arc<dyn IndexStore>,
    rewriter: Option<Arc<QueryRewriter>>,
    ranker: Arc<dyn Ranker>,
}

impl EmbeddingRetriever {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            rewriter: None,
            ranker: Arc::new(DefaultRanker),
        }
    }

    #[must_use]
    pub fn with_rewriter(mut self, rewriter: Arc<QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    #[must_use]
    pub fn with_ranker(mut self, ranker: Arc<dyn Ranker>) -> Self {
        self.ranker = ranker;
        self
    }
}

#[async_trait]
impl Retriever for EmbeddingRetriever {
    async fn retrieve_with_scores(
        &self,
        query: &str,
        topk: usize,
        score_threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, RetrieverError> {
        let mut queries = vec![query.to_string()];
        if let Some(rewriter) = &self.rewriter {
            match rewriter.rewrite(query).await {
                Ok(extra) => queries.extend(extra),
                Err(err) => {
                    // Rewriting is best effort; fall back to the original
                    // query.
                    warn!(error = %err, "query rewrite failed");
                }
            }
        }

        let lists = try_join_all(queries.iter().map(|q| {
            retry_transient(SEARCH_ATTEMPTS, move || {
                self.store
                    .similar_search_with_scores(q, topk, score_threshold, filter)
            })
        }))
        .await?;

        if lists.len() == 1 {
            let mut only = lists;
            return Ok(only.pop().unwrap_or_default());
        }
        Ok(self.ranker.rank(lists, topk).await?)
    }
}

/// Full-text retriever over a keyword-capable store.
pub struct KeywordRetriever {
    store: Arc<dyn IndexStore>,
}

impl KeywordRetriever {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve_with_scores(
        &self,
        query: &str,
        topk: usize,
        _score_threshold: Option<f32>,
        _filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, RetrieverError> {
        Ok(retry_transient(SEARCH_ATTEMPTS, || {
            self.store.full_text_search(query, topk)
        })
        .await?)
    }
}

/// Runs several retrievers concurrently and fuses the results.
pub struct HybridRetriever {
    retrievers: Vec<Arc<dyn Retriever>>,
    ranker: Arc<dyn Ranker>,
}

impl HybridRetriever {
    pub fn new(retrievers: Vec<Arc<dyn Retriever>>, ranker: Arc<dyn Ranker>) -> Self {
        Self { retrievers, ranker }
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve_with_scores(
        &self,
        query: &str,
        topk: usize,
        score_threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, RetrieverError> {
        let results = join_all(
            self.retrievers
                .iter()
                .map(|r| r.retrieve_with_scores(query, topk, score_threshold, filter)),
        )
        .await;

        // A single failed source degrades the result set instead of
        // failing the whole query, unless every source failed.
        let mut lists = Vec::with_capacity(results.len());
        let mut first_err = None;
        for result in results {
            match result {
                Ok(list) => lists.push(list),
                Err(err) => {
                    warn!(error = %err, "hybrid sub-retriever failed");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if lists.is_empty() {
            if let Some(err) = first_err {
                return Err(err);
            }
        }

        let fused = self.ranker.rank(lists, topk).await?;
        if fused.is_empty() {
            warn!(query, "hybrid retrieval produced no chunks");
        }
        Ok(fused)
    }
}
