//! Labeled property graph behind the GraphRAG engine.
//!
//! Vertices are documents, chunks, or entities; edges carry a label.
//! Structural labels are `include` (document to chunk, chunk to entity) and
//! `next` (chunk reading order); every other label is a relation extracted
//! from text, annotated with the id of the chunk it came from under
//! `_chunk_id`. Re-upserting a relation edge replaces its annotations.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graphrag::GraphRagError;

pub const EDGE_INCLUDE: &str = "include";
pub const EDGE_NEXT: &str = "next";

/// Metadata key recording which chunk a relation edge was extracted from.
pub const CHUNK_ID_KEY: &str = "_chunk_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexKind {
    Document,
    Chunk,
    Entity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: String,
    pub kind: VertexKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl Vertex {
    pub fn entity(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: VertexKind::Entity,
            description: None,
            metadata: FxHashMap::default(),
        }
    }

    pub fn chunk(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: VertexKind::Chunk,
            description: None,
            metadata: FxHashMap::default(),
        }
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: VertexKind::Document,
            description: None,
            metadata: FxHashMap::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub src: String,
    pub dst: String,
    pub label: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl Edge {
    pub fn new(src: impl Into<String>, label: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            label: label.into(),
            metadata: FxHashMap::default(),
        }
    }

    /// Whether this edge is an extracted relation rather than structure.
    pub fn is_relation(&self) -> bool {
        self.label != EDGE_INCLUDE && self.label != EDGE_NEXT
    }

    pub fn chunk_id(&self) -> Option<&str> {
        self.metadata.get(CHUNK_ID_KEY).and_then(Value::as_str)
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or replace a vertex by id.
    async fn upsert_vertex(&self, vertex: Vertex) -> Result<(), GraphRagError>;

    /// Insert or replace an edge keyed by (src, label, dst). Replacement
    /// swaps the metadata, so a re-extracted relation points at the new
    /// chunk id.
    async fn upsert_edge(&self, edge: Edge) -> Result<(), GraphRagError>;

    async fn get_vertex(&self, id: &str) -> Result<Option<Vertex>, GraphRagError>;

    /// All vertices of one kind.
    async fn vertices_of(&self, kind: VertexKind) -> Result<Vec<Vertex>, GraphRagError>;

    /// Edges touching `id`, in either direction.
    async fn edges_of(&self, id: &str) -> Result<Vec<Edge>, GraphRagError>;

    /// All relation edges as (subject, predicate, object) with the subject
    /// and object vertices resolved.
    async fn triplets(&self) -> Result<Vec<(Vertex, Edge, Vertex)>, GraphRagError>;

    /// Relation edges reachable from the given vertex ids within `depth`
    /// hops, following relation edges only.
    async fn explore(&self, ids: &[String], depth: usize) -> Result<Vec<Edge>, GraphRagError>;

    /// Remove everything.
    async fn drop_graph(&self) -> Result<(), GraphRagError>;
}

#[derive(Default)]
struct GraphData {
    vertices: FxHashMap<String, Vertex>,
    edges: Vec<Edge>,
}

/// In-memory [`GraphStore`].
#[derive(Default)]
pub struct MemoryGraphStore {
    data: RwLock<GraphData>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_vertex(&self, vertex: Vertex) -> Result<(), GraphRagError> {
        self.data.write().vertices.insert(vertex.id.clone(), vertex);
        Ok(())
    }

    async fn upsert_edge(&self, edge: Edge) -> Result<(), GraphRagError> {
        let mut data = self.data.write();
        match data
            .edges
            .iter_mut()
            .find(|e| e.src == edge.src && e.dst == edge.dst && e.label == edge.label)
        {
            Some(existing) => *existing = edge,
            None => data.edges.push(edge),
        }
        Ok(())
    }

    async fn get_vertex(&self, id: &str) -> Result<Option<Vertex>, GraphRagError> {
        Ok(self.data.read().vertices.get(id).cloned())
    }

    async fn vertices_of(&self, kind: VertexKind) -> Result<Vec<Vertex>, GraphRagError> {
        let mut found: Vec<Vertex> = self
            .data
            .read()
            .vertices
            .values()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn edges_of(&self, id: &str) -> Result<Vec<Edge>, GraphRagError> {
        Ok(self
            .data
            .read()
            .edges
            .iter()
            .filter(|e| e.src == id || e.dst == id)
            .cloned()
            .collect())
    }

    async fn triplets(&self) -> Result<Vec<(Vertex, Edge, Vertex)>, GraphRagError> {
        let data = self.data.read();
        Ok(data
            .edges
            .iter()
            .filter(|e| e.is_relation())
            .filter_map(|e| {
                let src = data.vertices.get(&e.src)?.clone();
                let dst = data.vertices.get(&e.dst)?.clone();
                Some((src, e.clone(), dst))
            })
            .collect())
    }

    async fn explore(&self, ids: &[String], depth: usize) -> Result<Vec<Edge>, GraphRagError> {
        let data = self.data.read();
        let mut frontier: Vec<String> = ids.to_vec();
        let mut visited: Vec<String> = frontier.clone();
        let mut found: Vec<Edge> = Vec::new();

        for _ in 0..depth.max(1) {
            let mut next = Vec::new();
            for edge in data.edges.iter().filter(|e| e.is_relation()) {
                let touches = frontier.contains(&edge.src) || frontier.contains(&edge.dst);
                if !touches {
                    continue;
                }
                if !found.contains(edge) {
                    found.push(edge.clone());
                }
                for endpoint in [&edge.src, &edge.dst] {
                    if !visited.contains(endpoint) {
                        visited.push(endpoint.clone());
                        next.push(endpoint.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(found)
    }

    async fn drop_graph(&self) -> Result<(), GraphRagError> {
        let mut data = self.data.write();
        data.vertices.clear();
        data.edges.clear();
        Ok(())
    }
}
