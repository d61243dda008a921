//! Community-summary GraphRAG engine.
//!
//! Building an index extracts entities and relations from every chunk into
//! a labeled graph, detects entity communities, and stores LLM summaries of
//! each community in a vector store. Querying fuses three sources into one
//! context chunk: community summaries and similar chunks (`{context}`,
//! rendered as numbered sections), the relation subgraph around the
//! question's entities (`{knowledge_graph}`), and the source chunks those
//! relations were extracted from (`{knowledge_graph_for_doc}`).

pub mod community;
pub mod extract;
pub mod store;

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::graphrag::community::{
    Community, CommunityDetector, CommunityStore, CommunitySummarizer,
};
use crate::graphrag::extract::{KeywordExtractor, TripletExtractor};
use crate::graphrag::store::{Edge, GraphStore, Vertex, CHUNK_ID_KEY, EDGE_INCLUDE, EDGE_NEXT};
use crate::model::client::ModelError;
use crate::rag::chunk::Chunk;
use crate::rag::store::{IndexStore, StorageError};

/// Errors raised by the GraphRAG engine.
#[derive(Debug, Error)]
pub enum GraphRagError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("graph index build failed: {message}")]
    Build { message: String },
}

/// Tunables for building and querying the graph index.
#[derive(Clone, Debug)]
pub struct GraphRagConfig {
    /// Concurrent LLM calls while extracting triplets.
    pub extract_batch_size: usize,
    /// Concurrent LLM calls while summarizing communities.
    pub community_summary_batch_size: usize,
    /// Result count for summary and chunk searches.
    pub topk: usize,
    pub score_threshold: Option<f32>,
    /// Hops followed from question entities into the relation graph.
    pub explore_depth: usize,
}

impl Default for GraphRagConfig {
    fn default() -> Self {
        Self {
            extract_batch_size: 5,
            community_summary_batch_size: 20,
            topk: 5,
            score_threshold: None,
            explore_depth: 2,
        }
    }
}

/// Header titles of a chunk in level order, as written by the markdown
/// splitter under `"Header N"` keys.
fn header_path(chunk: &Chunk) -> Vec<String> {
    (1..=6)
        .filter_map(|level| {
            chunk
                .metadata
                .get(&format!("Header {level}"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

const HYBRID_CONTEXT_TEMPLATE: &str = "\
The following information comes from document sections and a knowledge graph.\n\
=====\n\
{context}\n\
=====\n\
{graph_query}\
Knowledge graph relations:\n\
{knowledge_graph}\n\
Source passages for the relations:\n\
{knowledge_graph_for_doc}";

pub struct CommunitySummaryGraphEngine {
    chunk_store: Arc<dyn IndexStore>,
    graph: Arc<dyn GraphStore>,
    communities: CommunityStore,
    triplet_extractor: Arc<TripletExtractor>,
    keyword_extractor: Arc<KeywordExtractor>,
    detector: Arc<dyn CommunityDetector>,
    summarizer: CommunitySummarizer,
    config: GraphRagConfig,
}

impl CommunitySummaryGraphEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunk_store: Arc<dyn IndexStore>,
        graph: Arc<dyn GraphStore>,
        community_store: Arc<dyn IndexStore>,
        triplet_extractor: Arc<TripletExtractor>,
        keyword_extractor: Arc<KeywordExtractor>,
        detector: Arc<dyn CommunityDetector>,
        summarizer: CommunitySummarizer,
        config: GraphRagConfig,
    ) -> Self {
        Self {
            chunk_store,
            graph,
            communities: CommunityStore::new(community_store),
            triplet_extractor,
            keyword_extractor,
            detector,
            summarizer,
            config,
        }
    }

    /// Index one document's chunks: vector store, graph structure, entity
    /// relations, community summaries.
    #[instrument(skip(self, chunks), fields(doc_id, chunks = chunks.len()))]
    pub async fn build(&self, doc_id: &str, chunks: Vec<Chunk>) -> Result<(), GraphRagError> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.chunk_store.load(chunks.clone()).await?;

        self.graph.upsert_vertex(Vertex::document(doc_id)).await?;
        let mut prev: Option<String> = None;
        for chunk in &chunks {
            let mut vertex = Vertex::chunk(&chunk.chunk_id);
            vertex.description = Some(chunk.content.clone());
            self.graph.upsert_vertex(vertex).await?;
            self.graph
                .upsert_edge(Edge::new(doc_id, EDGE_INCLUDE, &chunk.chunk_id))
                .await?;
            if let Some(prev_id) = prev {
                self.graph
                    .upsert_edge(Edge::new(prev_id, EDGE_NEXT, &chunk.chunk_id))
                    .await?;
            }
            prev = Some(chunk.chunk_id.clone());
        }

        // Hierarchy from markdown header metadata: a chunk whose header
        // path extends an earlier chunk's path hangs off that chunk.
        // Chunks without a matching parent stay attached to the document
        // edge alone.
        let mut seen: Vec<(Vec<String>, String)> = Vec::new();
        for chunk in &chunks {
            let path = header_path(chunk);
            if let Some((_, parent_id)) = seen
                .iter()
                .rev()
                .find(|(p, _)| p.len() < path.len() && path.starts_with(p.as_slice()))
            {
                self.graph
                    .upsert_edge(Edge::new(parent_id, EDGE_INCLUDE, &chunk.chunk_id))
                    .await?;
            }
            seen.push((path, chunk.chunk_id.clone()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let extracted = self
            .triplet_extractor
            .extract_batch(&texts, self.config.extract_batch_size)
            .await?;
        for (chunk, triplets) in chunks.iter().zip(extracted) {
            for triplet in triplets {
                self.graph
                    .upsert_vertex(Vertex::entity(&triplet.subject))
                    .await?;
                self.graph
                    .upsert_vertex(Vertex::entity(&triplet.object))
                    .await?;
                let mut relation =
                    Edge::new(&triplet.subject, &triplet.predicate, &triplet.object);
                relation
                    .metadata
                    .insert(CHUNK_ID_KEY.into(), Value::String(chunk.chunk_id.clone()));
                self.graph.upsert_edge(relation).await?;
                for entity in [&triplet.subject, &triplet.object] {
                    self.graph
                        .upsert_edge(Edge::new(&chunk.chunk_id, EDGE_INCLUDE, entity))
                        .await?;
                }
            }
        }

        let communities = self.detector.detect(self.graph.as_ref()).await?;
        info!(communities = communities.len(), "detected entity communities");
        let summarized: Vec<Community> = self
            .summarizer
            .summarize(
                &communities,
                self.graph.as_ref(),
                self.config.community_summary_batch_size,
            )
            .await?;
        self.communities.save(&summarized).await?;
        Ok(())
    }

    /// Answer a question with one assembled context chunk.
    #[instrument(skip(self))]
    pub async fn query(&self, question: &str) -> Result<Chunk, GraphRagError> {
        let keywords = self.keyword_extractor.extract(question).await?;

        let summaries = self
            .communities
            .search(question, self.config.topk, self.config.score_threshold)
            .await?;
        let similar = self
            .chunk_store
            .similar_search_with_scores(
                question,
                self.config.topk,
                self.config.score_threshold,
                None,
            )
            .await?;

        let mut sections: Vec<String> = Vec::new();
        for chunk in summaries.iter().chain(similar.iter()) {
            if sections.iter().any(|s| s.ends_with(&chunk.content)) {
                continue;
            }
            sections.push(format!("Section {}:\n{}", sections.len() + 1, chunk.content));
        }
        if sections.is_empty() {
            warn!(question, "graph query found no context sections");
        }

        // Match question keywords to entity vertices, then walk relations.
        let mut entity_ids: Vec<String> = Vec::new();
        for keyword in &keywords {
            if let Some(vertex) = self.graph.get_vertex(keyword).await? {
                entity_ids.push(vertex.id);
            } else {
                let lowered = keyword.to_lowercase();
                for vertex in self
                    .graph
                    .vertices_of(store::VertexKind::Entity)
                    .await?
                {
                    if vertex.id.to_lowercase() == lowered && !entity_ids.contains(&vertex.id) {
                        entity_ids.push(vertex.id);
                    }
                }
            }
        }
        let relations = self
            .graph
            .explore(&entity_ids, self.config.explore_depth)
            .await?;
        let knowledge_graph: Vec<String> = relations
            .iter()
            .map(|e| format!("({}, {}, {})", e.src, e.label, e.dst))
            .collect();

        // Source passages: the chunks each relation was extracted from.
        let mut passages: Vec<String> = Vec::new();
        for relation in &relations {
            let Some(chunk_id) = relation.chunk_id() else {
                continue;
            };
            if let Some(vertex) = self.graph.get_vertex(chunk_id).await? {
                if let Some(content) = vertex.description {
                    if !passages.contains(&content) {
                        passages.push(content);
                    }
                }
            }
        }

        let graph_query = if keywords.is_empty() {
            String::new()
        } else {
            format!("Question entities: {}\n", keywords.join(", "))
        };

        let content = HYBRID_CONTEXT_TEMPLATE
            .replace("{context}", &sections.join("\n"))
            .replace("{graph_query}", &graph_query)
            .replace("{knowledge_graph}", &knowledge_graph.join("\n"))
            .replace("{knowledge_graph_for_doc}", &passages.join("\n"));

        let mut result = Chunk::new(content);
        result
            .metadata
            .insert("keywords".into(), Value::from(keywords));
        Ok(result)
    }

    /// Drop the graph index: community store, extractor caches, and the
    /// graph itself. Returns the dropped community collection name.
    pub async fn truncate(&self) -> Result<String, GraphRagError> {
        let name = self.communities.truncate().await?;
        self.triplet_extractor.clear_cache();
        self.keyword_extractor.clear_cache();
        self.graph.drop_graph().await?;
        Ok(name)
    }
}
