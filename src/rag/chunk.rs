//! Documents, chunks, and chunking parameters.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A source document before chunking.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One retrievable unit of text.
///
/// Every chunk owns a deep copy of its source document's metadata plus the
/// keys its splitter added, so mutating one chunk never leaks into another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    /// Retrieval score in [0, 1]; 0 before any retrieval ran.
    #[serde(default)]
    pub score: f32,
}

impl Chunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            chunk_id: Uuid::new_v4().to_string(),
            content: content.into(),
            metadata: FxHashMap::default(),
            score: 0.0,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: FxHashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }
}

/// Chunking strategy selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    Size,
    Page,
    Paragraph,
    Separator,
    MarkdownHeader,
}

/// Errors raised while configuring or running a splitter.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk_overlap ({overlap}) must not exceed chunk_size ({size})")]
    OverlapExceedsSize { size: usize, overlap: usize },

    #[error("separator must not be empty")]
    EmptySeparator,
}

/// Validated chunking parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkParameters {
    pub strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separator: String,
    /// Merge adjacent small pieces up to `chunk_size` after a paragraph
    /// or separator split.
    #[serde(default)]
    pub enable_merge: bool,
}

impl ChunkParameters {
    /// Build parameters, rejecting an overlap larger than the chunk size
    /// and empty separators up front.
    pub fn new(
        strategy: ChunkStrategy,
        chunk_size: usize,
        chunk_overlap: usize,
        separator: impl Into<String>,
    ) -> Result<Self, ChunkError> {
        let separator = separator.into();
        if chunk_overlap > chunk_size {
            return Err(ChunkError::OverlapExceedsSize {
                size: chunk_size,
                overlap: chunk_overlap,
            });
        }
        if separator.is_empty() {
            return Err(ChunkError::EmptySeparator);
        }
        Ok(Self {
            strategy,
            chunk_size,
            chunk_overlap,
            separator,
            enable_merge: false,
        })
    }

    /// Size strategy with the `"\n\n"` separator.
    pub fn by_size(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ChunkError> {
        Self::new(ChunkStrategy::Size, chunk_size, chunk_overlap, "\n\n")
    }

    #[must_use]
    pub fn with_merge(mut self, enable_merge: bool) -> Self {
        self.enable_merge = enable_merge;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_larger_than_size_is_rejected() {
        assert!(matches!(
            ChunkParameters::by_size(100, 200),
            Err(ChunkError::OverlapExceedsSize { .. })
        ));
        assert!(ChunkParameters::by_size(100, 100).is_ok());
    }

    #[test]
    fn chunk_metadata_is_an_independent_copy() {
        let doc = Document::new("text").with_metadata("source", "a.md".into());
        let mut chunk = Chunk::new(doc.content.clone()).with_metadata(doc.metadata.clone());
        chunk.metadata.insert("extra".into(), 1.into());
        assert!(!doc.metadata.contains_key("extra"));
    }
}
