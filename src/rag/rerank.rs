//! Result ranking for single and multi-source retrieval.
//!
//! A [`Ranker`] merges one candidate list per retrieval source into a
//! final ordering. [`RrfRanker`] implements reciprocal rank fusion,
//! `score = sum over sources of 1 / (k + rank)` with 1-based ranks;
//! [`RerankModelRanker`] delegates scoring to an external rerank model
//! behind the [`RerankClient`] seam.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::model::client::{LlmClient, ModelError};
use crate::model::{ModelMessage, ModelRequest};
use crate::rag::chunk::Chunk;

/// Merges per-source candidate lists into one ranked list of at most
/// `topk` chunks, deduplicated by content.
#[async_trait]
pub trait Ranker: Send + Sync {
    async fn rank(&self, candidates: Vec<Vec<Chunk>>, topk: usize)
        -> Result<Vec<Chunk>, ModelError>;
}

/// Orders by the retrieval scores already attached to the chunks.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRanker;

#[async_trait]
impl Ranker for DefaultRanker {
    async fn rank(
        &self,
        candidates: Vec<Vec<Chunk>>,
        topk: usize,
    ) -> Result<Vec<Chunk>, ModelError> {
        let mut merged: Vec<Chunk> = Vec::new();
        for chunk in candidates.into_iter().flatten() {
            match merged.iter_mut().find(|c| c.content == chunk.content) {
                Some(existing) => {
                    if chunk.score > existing.score {
                        existing.score = chunk.score;
                    }
                }
                None => merged.push(chunk),
            }
        }
        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.truncate(topk);
        Ok(merged)
    }
}

/// Reciprocal rank fusion.
#[derive(Clone, Copy, Debug)]
pub struct RrfRanker {
    /// Dampening constant; 60 per the original formulation.
    pub k: f32,
}

impl Default for RrfRanker {
    fn default() -> Self {
        Self { k: 60.0 }
    }
}

#[async_trait]
impl Ranker for RrfRanker {
    async fn rank(
        &self,
        candidates: Vec<Vec<Chunk>>,
        topk: usize,
    ) -> Result<Vec<Chunk>, ModelError> {
        // Content keys to fused score; first occurrence keeps the chunk.
        let mut fused: Vec<Chunk> = Vec::new();
        let mut scores: FxHashMap<String, f32> = FxHashMap::default();
        for list in candidates {
            for (position, chunk) in list.into_iter().enumerate() {
                let rank = (position + 1) as f32;
                let contribution = 1.0 / (self.k + rank);
                let entry = scores.entry(chunk.content.clone()).or_insert(0.0);
                *entry += contribution;
                if !fused.iter().any(|c| c.content == chunk.content) {
                    fused.push(chunk);
                }
            }
        }
        for chunk in &mut fused {
            chunk.score = scores.get(&chunk.content).copied().unwrap_or(0.0);
        }
        fused.sort_by(|a, b| b.score.total_cmp(&a.score));
        fused.truncate(topk);
        Ok(fused)
    }
}

/// External rerank model seam.
#[async_trait]
pub trait RerankClient: Send + Sync {
    /// Relevance score per document, in document order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, ModelError>;
}

/// Reranks the merged candidate set with an external model.
pub struct RerankModelRanker {
    client: Arc<dyn RerankClient>,
    query: String,
}

impl RerankModelRanker {
    pub fn new(client: Arc<dyn RerankClient>, query: impl Into<String>) -> Self {
        Self {
            client,
            query: query.into(),
        }
    }
}

#[async_trait]
impl Ranker for RerankModelRanker {
    async fn rank(
        &self,
        candidates: Vec<Vec<Chunk>>,
        topk: usize,
    ) -> Result<Vec<Chunk>, ModelError> {
        let mut merged: Vec<Chunk> = Vec::new();
        for chunk in candidates.into_iter().flatten() {
            if !merged.iter().any(|c| c.content == chunk.content) {
                merged.push(chunk);
            }
        }
        if merged.is_empty() {
            return Ok(merged);
        }
        let documents: Vec<String> = merged.iter().map(|c| c.content.clone()).collect();
        let scores = self.client.score(&self.query, &documents).await?;
        if scores.len() != merged.len() {
            return Err(ModelError::InvalidResponse {
                message: format!(
                    "rerank model returned {} scores for {} documents",
                    scores.len(),
                    merged.len()
                ),
            });
        }
        for (chunk, score) in merged.iter_mut().zip(scores) {
            chunk.score = score;
        }
        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.truncate(topk);
        Ok(merged)
    }
}

const REWRITE_PROMPT: &str = "Generate {nums} search queries related to: {query}. \
Provide the queries in a single line, separated by commas, without numbering.";

/// Expands a user query into several search queries via the LLM.
pub struct QueryRewriter {
    client: Arc<dyn LlmClient>,
    model: String,
    nums: usize,
}

impl QueryRewriter {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>, nums: usize) -> Self {
        Self {
            client,
            model: model.into(),
            nums,
        }
    }

    pub async fn rewrite(&self, origin_query: &str) -> Result<Vec<String>, ModelError> {
        let prompt = REWRITE_PROMPT
            .replace("{nums}", &self.nums.to_string())
            .replace("{query}", origin_query);
        let request = ModelRequest::builder(&self.model)
            .message(ModelMessage::human(prompt))
            .build()
            .map_err(|err| ModelError::InvalidResponse {
                message: err.to_string(),
            })?;
        let output = self.client.generate(&request).await?;
        Ok(parse_rewritten_queries(
            output.text().unwrap_or_default(),
            self.nums,
        ))
    }
}

/// Split model output into clean queries: separators are `,` `，` `?` `？`,
/// results are lowercased, trimmed, deduplicated, and capped at `nums`.
pub fn parse_rewritten_queries(raw: &str, nums: usize) -> Vec<String> {
    let mut queries = Vec::new();
    for part in raw.split(|c| matches!(c, ',' | '，' | '?' | '？')) {
        let cleaned = part.trim().to_lowercase();
        if cleaned.is_empty() || queries.contains(&cleaned) {
            continue;
        }
        queries.push(cleaned);
        if queries.len() == nums {
            break;
        }
    }
    queries
}
