//! Retrieval-augmented generation core: chunking, embeddings, index
//! stores, retrievers, and rerankers.

pub mod chunk;
pub mod chunking;
pub mod embedding;
pub mod rerank;
pub mod retriever;
pub mod store;
