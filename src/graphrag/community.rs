//! Community detection and summarization over the entity graph.
//!
//! Detection is a plugin seam: the default detector computes connected
//! components over relation edges, which is enough for small graphs and
//! deterministic tests; denser deployments plug in a modularity-based
//! detector behind the same trait. Summaries are produced by the LLM in
//! batches and stored in a vector store for retrieval at query time.

use async_trait::async_trait;
use futures_util::future::try_join_all;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::graphrag::store::{GraphStore, VertexKind};
use crate::graphrag::GraphRagError;
use crate::model::client::LlmClient;
use crate::model::{ModelMessage, ModelRequest};
use crate::rag::chunk::Chunk;
use crate::rag::store::IndexStore;

/// One detected community of entities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    /// Entity vertex ids, sorted.
    pub entities: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[async_trait]
pub trait CommunityDetector: Send + Sync {
    async fn detect(&self, store: &dyn GraphStore) -> Result<Vec<Community>, GraphRagError>;
}

/// Connected components over relation edges.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectedComponentDetector;

#[async_trait]
impl CommunityDetector for ConnectedComponentDetector {
    async fn detect(&self, store: &dyn GraphStore) -> Result<Vec<Community>, GraphRagError> {
        let entities = store.vertices_of(VertexKind::Entity).await?;
        let triplets = store.triplets().await?;

        let mut component: FxHashMap<String, usize> = FxHashMap::default();
        for (i, vertex) in entities.iter().enumerate() {
            component.insert(vertex.id.clone(), i);
        }
        // Union endpoints until no relation crosses two components.
        let mut changed = true;
        while changed {
            changed = false;
            for (src, _, dst) in &triplets {
                let (Some(&a), Some(&b)) = (component.get(&src.id), component.get(&dst.id))
                else {
                    continue;
                };
                if a != b {
                    let low = a.min(b);
                    let high = a.max(b);
                    for slot in component.values_mut() {
                        if *slot == high {
                            *slot = low;
                        }
                    }
                    changed = true;
                }
            }
        }

        let mut grouped: FxHashMap<usize, Vec<String>> = FxHashMap::default();
        for (id, slot) in component {
            grouped.entry(slot).or_default().push(id);
        }
        let mut communities: Vec<Community> = grouped
            .into_values()
            .map(|mut entities| {
                entities.sort();
                Community {
                    id: format!("community-{}", entities[0]),
                    entities,
                    summary: None,
                }
            })
            .collect();
        communities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(communities)
    }
}

const SUMMARY_PROMPT: &str = "Write a short factual summary of the entity group below, \
based only on the listed relations.\nEntities: {entities}\nRelations:\n{relations}";

/// LLM summaries for detected communities.
pub struct CommunitySummarizer {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl CommunitySummarizer {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    async fn summarize_one(
        &self,
        community: &Community,
        store: &dyn GraphStore,
    ) -> Result<Community, GraphRagError> {
        let triplets = store.triplets().await?;
        let relations: Vec<String> = triplets
            .iter()
            .filter(|(src, _, dst)| {
                community.entities.contains(&src.id) || community.entities.contains(&dst.id)
            })
            .map(|(src, edge, dst)| format!("({}, {}, {})", src.id, edge.label, dst.id))
            .collect();

        let prompt = SUMMARY_PROMPT
            .replace("{entities}", &community.entities.join(", "))
            .replace("{relations}", &relations.join("\n"));
        let request = ModelRequest::builder(&self.model)
            .message(ModelMessage::human(prompt))
            .build()
            .map_err(|err| {
                GraphRagError::Build {
                    message: err.to_string(),
                }
            })?;
        let output = self.client.generate(&request).await?;
        Ok(Community {
            summary: Some(output.text().unwrap_or_default().to_string()),
            ..community.clone()
        })
    }

    /// Summarize all communities, `batch_size` concurrent model calls at a
    /// time, preserving input order.
    pub async fn summarize(
        &self,
        communities: &[Community],
        store: &dyn GraphStore,
        batch_size: usize,
    ) -> Result<Vec<Community>, GraphRagError> {
        let mut out = Vec::with_capacity(communities.len());
        for batch in communities.chunks(batch_size.max(1)) {
            let summarized =
                try_join_all(batch.iter().map(|c| self.summarize_one(c, store))).await?;
            out.extend(summarized);
        }
        Ok(out)
    }
}

/// Vector store of community summaries.
pub struct CommunityStore {
    store: Arc<dyn IndexStore>,
}

impl CommunityStore {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, communities: &[Community]) -> Result<(), GraphRagError> {
        let chunks: Vec<Chunk> = communities
            .iter()
            .filter_map(|community| {
                community.summary.as_ref().map(|summary| {
                    let mut chunk = Chunk::new(summary.clone());
                    chunk.chunk_id = community.id.clone();
                    chunk
                        .metadata
                        .insert("community_id".into(), Value::String(community.id.clone()));
                    chunk
                })
            })
            .collect();
        if !chunks.is_empty() {
            self.store.load(chunks).await?;
        }
        Ok(())
    }

    pub async fn search(
        &self,
        query: &str,
        topk: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<Chunk>, GraphRagError> {
        Ok(self
            .store
            .similar_search_with_scores(query, topk, score_threshold, None)
            .await?)
    }

    pub async fn truncate(&self) -> Result<String, GraphRagError> {
        Ok(self.store.drop_collection().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphrag::store::{Edge, MemoryGraphStore, Vertex};

    #[tokio::test]
    async fn connected_components_group_linked_entities() {
        let store = MemoryGraphStore::new();
        for id in ["A", "B", "C", "D"] {
            store.upsert_vertex(Vertex::entity(id)).await.unwrap();
        }
        store.upsert_edge(Edge::new("A", "r1", "B")).await.unwrap();
        store.upsert_edge(Edge::new("B", "r2", "C")).await.unwrap();

        let communities = ConnectedComponentDetector
            .detect(&store)
            .await
            .unwrap();
        assert_eq!(communities.len(), 2);
        assert_eq!(communities[0].entities, vec!["A", "B", "C"]);
        assert_eq!(communities[1].entities, vec!["D"]);
    }
}
