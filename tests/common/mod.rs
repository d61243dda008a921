//! Shared test doubles: a scripted LLM client and a deterministic embedder.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use awel::model::client::{LlmClient, ModelError, ModelMetadata, ModelOutputStream};
use awel::model::{MediaContent, ModelOutput, ModelRequest};
use awel::rag::embedding::Embedder;

/// LLM fake answering by prompt substring rules.
///
/// `generate` scans the last message for each rule's needle and returns the
/// first matching canned text; unmatched prompts get the default text.
/// `generate_stream` yields the same answer as word-level deltas.
pub struct MockLlm {
    rules: Vec<(String, String)>,
    default: String,
}

impl MockLlm {
    pub fn answering(default: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default: default.into(),
        }
    }

    pub fn rule(mut self, needle: impl Into<String>, answer: impl Into<String>) -> Self {
        self.rules.push((needle.into(), answer.into()));
        self
    }

    fn answer_for(&self, request: &ModelRequest) -> String {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelOutput, ModelError> {
        Ok(ModelOutput::success(self.answer_for(request)))
    }

    async fn generate_stream(
        &self,
        request: &ModelRequest,
    ) -> Result<ModelOutputStream, ModelError> {
        let answer = self.answer_for(request);
        let words: Vec<String> = answer
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let frames = words.into_iter().map(|word| {
            Ok(ModelOutput {
                content: vec![MediaContent::text(word)],
                incremental: true,
                ..Default::default()
            })
        });
        Ok(Box::pin(stream::iter(frames)))
    }

    async fn count_tokens(&self, _model: &str, text: &str) -> Result<u32, ModelError> {
        Ok(text.split_whitespace().count() as u32)
    }

    async fn models(&self) -> Result<Vec<ModelMetadata>, ModelError> {
        Ok(vec![ModelMetadata {
            model: "mock/model".into(),
            context_length: Some(8192),
            supports_system_role: true,
        }])
    }
}

/// Deterministic token-hash embedder.
///
/// Each token bumps one of 64 dimensions, so texts sharing words embed
/// close together and disjoint texts embed (near) orthogonally.
pub struct HashEmbedder;

impl HashEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 64];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let idx = (hasher.finish() % 64) as usize;
            v[idx] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}
