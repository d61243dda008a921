//! LLM-backed extraction of triplets and query keywords.
//!
//! Both extractors cache by input text so rebuilding an index does not
//! re-prompt the model for unchanged chunks, and both run batched over
//! many inputs with bounded concurrency.

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::OnceLock;

use crate::model::client::{LlmClient, ModelError};
use crate::model::{ModelMessage, ModelRequest};

const TRIPLET_PROMPT: &str = "Extract up to {max} knowledge triplets from the text below. \
Answer with one triplet per line in the form (subject, predicate, object) and nothing else.\n\
Text:\n{text}";

const KEYWORD_PROMPT: &str = "Extract up to {max} search keywords and entity names from the \
question below. Answer with a single comma-separated line and nothing else.\n\
Question:\n{text}";

/// One extracted (subject, predicate, object) relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triplet {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

fn triplet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\(\s*([^,()]+?)\s*,\s*([^,()]+?)\s*,\s*([^,()]+?)\s*\)")
            .unwrap_or_else(|_| unreachable!())
    })
}

/// Parse `(subject, predicate, object)` lines out of model output.
pub fn parse_triplets(raw: &str) -> Vec<Triplet> {
    triplet_regex()
        .captures_iter(raw)
        .map(|caps| Triplet {
            subject: caps[1].to_string(),
            predicate: caps[2].to_string(),
            object: caps[3].to_string(),
        })
        .collect()
}

/// Parse a comma-separated keyword line out of model output.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    for part in raw.split([',', '，', '\n']) {
        let cleaned = part.trim().trim_matches('"').to_string();
        if cleaned.is_empty() || keywords.contains(&cleaned) {
            continue;
        }
        keywords.push(cleaned);
    }
    keywords
}

async fn prompt_model(
    client: &dyn LlmClient,
    model: &str,
    template: &str,
    text: &str,
    max: usize,
) -> Result<String, ModelError> {
    let prompt = template
        .replace("{max}", &max.to_string())
        .replace("{text}", text);
    let request = ModelRequest::builder(model)
        .message(ModelMessage::human(prompt))
        .build()
        .map_err(|err| ModelError::InvalidResponse {
            message: err.to_string(),
        })?;
    let output = client.generate(&request).await?;
    if output.has_error() {
        return Err(ModelError::Provider {
            code: output.error_code,
            message: output.text().unwrap_or("extraction failed").to_string(),
        });
    }
    Ok(output.text().unwrap_or_default().to_string())
}

/// Extracts knowledge triplets from chunk text.
pub struct TripletExtractor {
    client: Arc<dyn LlmClient>,
    model: String,
    max_triplets: usize,
    cache: Mutex<FxHashMap<String, Vec<Triplet>>>,
}

impl TripletExtractor {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_triplets: 10,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn extract(&self, text: &str) -> Result<Vec<Triplet>, ModelError> {
        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }
        let raw = prompt_model(
            self.client.as_ref(),
            &self.model,
            TRIPLET_PROMPT,
            text,
            self.max_triplets,
        )
        .await?;
        let triplets = parse_triplets(&raw);
        self.cache
            .lock()
            .insert(text.to_string(), triplets.clone());
        Ok(triplets)
    }

    /// Extract from many texts, `batch_size` concurrent model calls at a
    /// time, results in input order.
    pub async fn extract_batch(
        &self,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<Vec<Triplet>>, ModelError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            let results = try_join_all(batch.iter().map(|text| self.extract(text))).await?;
            out.extend(results);
        }
        Ok(out)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

/// Extracts search keywords from a user question.
pub struct KeywordExtractor {
    client: Arc<dyn LlmClient>,
    model: String,
    max_keywords: usize,
    cache: Mutex<FxHashMap<String, Vec<String>>>,
}

impl KeywordExtractor {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_keywords: 5,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn extract(&self, question: &str) -> Result<Vec<String>, ModelError> {
        if let Some(cached) = self.cache.lock().get(question) {
            return Ok(cached.clone());
        }
        let raw = prompt_model(
            self.client.as_ref(),
            &self.model,
            KEYWORD_PROMPT,
            question,
            self.max_keywords,
        )
        .await?;
        let mut keywords = parse_keywords(&raw);
        keywords.truncate(self.max_keywords);
        self.cache
            .lock()
            .insert(question.to_string(), keywords.clone());
        Ok(keywords)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
