//! In-memory index stores.
//!
//! [`InMemoryVectorStore`] backs similarity search with an [`Embedder`] and
//! cosine scores; [`InMemoryFullTextStore`] backs keyword search with BM25.
//! Both keep insertion order as the tiebreak for equal scores and treat a
//! reloaded chunk id as an in-place replacement.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::warn;

use crate::rag::chunk::Chunk;
use crate::rag::embedding::{cosine_similarity, Embedder};
use crate::rag::store::{IndexStore, IndexStoreConfig, MetadataFilter, StorageError};

pub struct InMemoryVectorStore {
    config: IndexStoreConfig,
    embedder: Arc<dyn Embedder>,
    rows: RwLock<Vec<(Chunk, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new(config: IndexStoreConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl IndexStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn load(&self, chunks: Vec<Chunk>) -> Result<Vec<String>, StorageError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(StorageError::Invalid {
                message: format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    chunks.len()
                ),
            });
        }

        let mut rows = self.rows.write();
        let mut ids = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            ids.push(chunk.chunk_id.clone());
            match rows.iter_mut().find(|(c, _)| c.chunk_id == chunk.chunk_id) {
                // Replacement keeps the original insertion position.
                Some(slot) => *slot = (chunk, vector),
                None => rows.push((chunk, vector)),
            }
        }
        Ok(ids)
    }

    async fn similar_search_with_scores(
        &self,
        text: &str,
        topk: usize,
        score_threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, StorageError> {
        let query = self.embedder.embed_query(text).await?;
        let mut scored: Vec<Chunk> = self
            .rows
            .read()
            .iter()
            .filter(|(chunk, _)| filter.map_or(true, |f| f.matches(&chunk.metadata)))
            .map(|(chunk, vector)| {
                let score = cosine_similarity(&query, vector).clamp(0.0, 1.0);
                chunk.clone().with_score(score)
            })
            .filter(|chunk| score_threshold.map_or(true, |t| chunk.score >= t))
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(topk);
        if scored.is_empty() {
            warn!(collection = %self.config.name, "similarity search returned no chunks");
        }
        Ok(scored)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize, StorageError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|(chunk, _)| !ids.contains(&chunk.chunk_id));
        Ok(before - rows.len())
    }

    async fn drop_collection(&self) -> Result<String, StorageError> {
        self.rows.write().clear();
        Ok(self.config.name.clone())
    }

    async fn truncate(&self) -> Result<Vec<String>, StorageError> {
        let mut rows = self.rows.write();
        let ids = rows.iter().map(|(c, _)| c.chunk_id.clone()).collect();
        rows.clear();
        Ok(ids)
    }

    async fn vector_name_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(name == self.config.name)
    }
}

struct FullTextRow {
    chunk: Chunk,
    terms: FxHashMap<String, usize>,
    token_count: usize,
}

/// BM25 keyword store. `k1` and `b` follow the usual defaults.
pub struct InMemoryFullTextStore {
    config: IndexStoreConfig,
    rows: RwLock<Vec<FullTextRow>>,
    k1: f32,
    b: f32,
}

impl InMemoryFullTextStore {
    pub fn new(config: IndexStoreConfig) -> Self {
        Self {
            config,
            rows: RwLock::new(Vec::new()),
            k1: 1.2,
            b: 0.75,
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl IndexStore for InMemoryFullTextStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn load(&self, chunks: Vec<Chunk>) -> Result<Vec<String>, StorageError> {
        let mut rows = self.rows.write();
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ids.push(chunk.chunk_id.clone());
            let tokens = tokenize(&chunk.content);
            let token_count = tokens.len();
            let mut terms = FxHashMap::default();
            for token in tokens {
                *terms.entry(token).or_insert(0) += 1;
            }
            let row = FullTextRow {
                chunk,
                terms,
                token_count,
            };
            match rows
                .iter_mut()
                .find(|r| r.chunk.chunk_id == row.chunk.chunk_id)
            {
                Some(slot) => *slot = row,
                None => rows.push(row),
            }
        }
        Ok(ids)
    }

    async fn similar_search_with_scores(
        &self,
        _text: &str,
        _topk: usize,
        _score_threshold: Option<f32>,
        _filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Chunk>, StorageError> {
        Err(StorageError::Unsupported {
            operation: "similar_search".to_string(),
        })
    }

    async fn full_text_search(&self, text: &str, topk: usize) -> Result<Vec<Chunk>, StorageError> {
        let query_terms = tokenize(text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.rows.read();
        let n = rows.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let avg_len: f32 =
            rows.iter().map(|r| r.token_count as f32).sum::<f32>() / n as f32;

        let mut scored: Vec<Chunk> = rows
            .iter()
            .filter_map(|row| {
                let mut score = 0.0f32;
                for term in &query_terms {
                    let tf = *row.terms.get(term).unwrap_or(&0) as f32;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = rows.iter().filter(|r| r.terms.contains_key(term)).count() as f32;
                    let idf = ((n as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let denom = tf
                        + self.k1
                            * (1.0 - self.b + self.b * row.token_count as f32 / avg_len.max(1.0));
                    score += idf * tf * (self.k1 + 1.0) / denom;
                }
                (score > 0.0).then(|| row.chunk.clone().with_score(score))
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(topk);
        Ok(scored)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize, StorageError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| !ids.contains(&row.chunk.chunk_id));
        Ok(before - rows.len())
    }

    async fn drop_collection(&self) -> Result<String, StorageError> {
        self.rows.write().clear();
        Ok(self.config.name.clone())
    }

    async fn truncate(&self) -> Result<Vec<String>, StorageError> {
        let mut rows = self.rows.write();
        let ids = rows.iter().map(|r| r.chunk.chunk_id.clone()).collect();
        rows.clear();
        Ok(ids)
    }

    async fn vector_name_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(name == self.config.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::client::ModelError;

    /// Bag-of-words embedder over a tiny fixed vocabulary.
    pub(crate) struct BagEmbedder;

    const VOCAB: [&str; 4] = ["apple", "banana", "cherry", "plum"];

    #[async_trait]
    impl Embedder for BagEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let tokens = tokenize(text);
                    VOCAB
                        .iter()
                        .map(|word| tokens.iter().filter(|t| t == word).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    fn store() -> InMemoryVectorStore {
        InMemoryVectorStore::new(IndexStoreConfig::new("test"), Arc::new(BagEmbedder))
    }

    #[tokio::test]
    async fn threshold_drops_weak_matches() {
        let s = store();
        s.load(vec![
            Chunk::new("apple apple banana"),
            Chunk::new("cherry plum"),
        ])
        .await
        .unwrap();

        let hits = s
            .similar_search_with_scores("apple", 10, Some(0.5), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("apple"));
        assert!(hits[0].score >= 0.5 && hits[0].score <= 1.0);
    }

    #[tokio::test]
    async fn reload_replaces_in_place() {
        let s = store();
        let mut first = Chunk::new("apple");
        first.chunk_id = "fixed".to_string();
        let second = Chunk::new("banana");
        s.load(vec![first, second]).await.unwrap();

        let mut replacement = Chunk::new("apple cherry");
        replacement.chunk_id = "fixed".to_string();
        s.load(vec![replacement]).await.unwrap();

        assert_eq!(s.len(), 2);
        let hits = s.similar_search("cherry", 10).await.unwrap();
        assert_eq!(hits[0].chunk_id, "fixed");
    }

    #[tokio::test]
    async fn full_text_store_ranks_by_bm25() {
        let s = InMemoryFullTextStore::new(IndexStoreConfig::new("ft"));
        s.load(vec![
            Chunk::new("the quick brown fox"),
            Chunk::new("quick quick quick sort algorithm"),
            Chunk::new("unrelated text entirely"),
        ])
        .await
        .unwrap();

        let hits = s.full_text_search("quick", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("quick quick quick"));
    }

    #[tokio::test]
    async fn vector_search_on_full_text_store_is_unsupported() {
        let s = InMemoryFullTextStore::new(IndexStoreConfig::new("ft"));
        assert!(matches!(
            s.similar_search("x", 1).await,
            Err(StorageError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn truncate_clears_rows_but_keeps_collection() {
        let s = store();
        s.load(vec![Chunk::new("apple"), Chunk::new("banana")])
            .await
            .unwrap();

        let removed = s.truncate().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(s.is_empty());
        assert!(s.vector_name_exists("test").await.unwrap());
        assert!(!s.vector_name_exists("other").await.unwrap());

        // The collection still accepts rows after a truncate.
        s.load(vec![Chunk::new("cherry")]).await.unwrap();
        assert_eq!(s.len(), 1);
    }

    #[tokio::test]
    async fn full_text_truncate_returns_removed_ids() {
        let s = InMemoryFullTextStore::new(IndexStoreConfig::new("ft"));
        let chunk = Chunk::new("quick fox");
        let id = chunk.chunk_id.clone();
        s.load(vec![chunk]).await.unwrap();

        assert_eq!(s.truncate().await.unwrap(), vec![id]);
        assert!(s.full_text_search("quick", 10).await.unwrap().is_empty());
        assert!(s.vector_name_exists("ft").await.unwrap());
    }

    #[tokio::test]
    async fn load_with_limit_preserves_input_order() {
        let s = store();
        let chunks: Vec<Chunk> = (0..25).map(|i| Chunk::new(format!("apple {i}"))).collect();
        let expected: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let ids = s.load_with_limit(chunks, 4, 3).await.unwrap();
        assert_eq!(ids, expected);
    }
}
