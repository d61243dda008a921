//! End-to-end retrieval pipeline: chunk, load, search, fuse.

mod common;

use std::sync::Arc;

use awel::rag::chunk::{Chunk, ChunkParameters, Document};
use awel::rag::chunking::ChunkManager;
use awel::rag::rerank::RrfRanker;
use awel::rag::retriever::{EmbeddingRetriever, HybridRetriever, KeywordRetriever, Retriever};
use awel::rag::store::memory::{InMemoryFullTextStore, InMemoryVectorStore};
use awel::rag::store::{IndexStore, IndexStoreConfig};

use common::HashEmbedder;

fn vector_store(name: &str) -> Arc<InMemoryVectorStore> {
    Arc::new(InMemoryVectorStore::new(
        IndexStoreConfig::new(name),
        Arc::new(HashEmbedder),
    ))
}

#[tokio::test]
async fn chunked_document_is_retrievable_with_overlap() {
    // Ten 100-character paragraphs, windows of 300 with 50 overlap.
    let paragraphs: Vec<String> = (0..10)
        .map(|i| {
            let word = format!("topic{i:02} ");
            let mut p = word.repeat(20);
            p.truncate(100);
            p
        })
        .collect();
    let document = Document::new(paragraphs.join("\n\n"));
    let manager = ChunkManager::new(ChunkParameters::by_size(300, 50).unwrap());
    let chunks = manager.split(&document).unwrap();

    assert!(chunks.len() > 1);
    for pair in chunks.windows(2) {
        let shared = (1..=pair[0].content.len().min(pair[1].content.len()))
            .rev()
            .find(|&n| pair[0].content.ends_with(&pair[1].content[..n]))
            .unwrap_or(0);
        assert!(shared >= 50, "adjacent chunks must share the overlap");
    }

    let store = vector_store("docs");
    store.load(chunks).await.unwrap();
    let hits = store.similar_search("topic03", 3).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].content.contains("topic03"));
}

#[tokio::test]
async fn batched_load_returns_ids_in_input_order() {
    let store = vector_store("batched");
    let chunks: Vec<Chunk> = (0..23)
        .map(|i| Chunk::new(format!("passage number {i}")))
        .collect();
    let expected: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

    let ids = store.load_with_limit(chunks, 5, 4).await.unwrap();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn threshold_search_clamps_and_filters_scores() {
    let store = vector_store("threshold");
    store
        .load(vec![
            Chunk::new("rust ownership borrowing lifetimes"),
            Chunk::new("tomato gardening advice"),
        ])
        .await
        .unwrap();

    let hits = store
        .similar_search_with_scores("rust ownership", 10, Some(0.6), None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("ownership"));
    for hit in &hits {
        assert!((0.0..=1.0).contains(&hit.score));
    }
}

#[tokio::test]
async fn hybrid_retrieval_fuses_vector_and_keyword_sources() {
    let vectors = vector_store("hybrid-vec");
    let keywords = Arc::new(InMemoryFullTextStore::new(IndexStoreConfig::new(
        "hybrid-kw",
    )));

    let corpus = [
        "rust ownership model explained",
        "borrow checker and lifetimes in rust",
        "async runtimes and task scheduling",
        "cooking pasta in ten minutes",
    ];
    for text in corpus {
        vectors.load(vec![Chunk::new(text)]).await.unwrap();
        keywords.load(vec![Chunk::new(text)]).await.unwrap();
    }

    let hybrid = HybridRetriever::new(
        vec![
            Arc::new(EmbeddingRetriever::new(vectors)),
            Arc::new(KeywordRetriever::new(keywords)),
        ],
        Arc::new(RrfRanker::default()),
    );

    let fused = hybrid
        .retrieve_with_scores("rust ownership", 3, None, None)
        .await
        .unwrap();
    assert!(!fused.is_empty());
    assert!(fused.len() <= 3);
    // The document both sources agree on outranks single-source hits.
    assert!(fused[0].content.contains("rust ownership"));
    // Fused scores follow reciprocal rank fusion, so the best possible
    // two-source score with k=60 is 2/61.
    assert!(fused[0].score <= 2.0 / 61.0 + 1e-6);
    for pair in fused.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn multi_query_fanout_keeps_query_order() {
    let store = vector_store("fanout");
    store
        .load(vec![
            Chunk::new("alpha doc about parsing"),
            Chunk::new("beta doc about rendering"),
        ])
        .await
        .unwrap();

    let retriever = EmbeddingRetriever::new(store);
    let queries = vec!["parsing alpha".to_string(), "rendering beta".to_string()];
    let lists = retriever.retrieve_multi(&queries, 1, None, None).await.unwrap();

    assert_eq!(lists.len(), 2);
    assert!(lists[0][0].content.contains("parsing"));
    assert!(lists[1][0].content.contains("rendering"));
}
