//! Provider-neutral LLM client seam.
//!
//! Operators never talk to a provider directly; they call an [`LlmClient`].
//! Production deployments implement it over a proxy or worker pool, tests
//! inject scripted fakes. [`ModelMetadataCache`] fronts the (potentially
//! slow) model listing with a short TTL.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::model::{ModelOutput, ModelRequest};

/// Errors raised by model clients.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The provider answered with an error.
    #[error("model provider error {code}: {message}")]
    Provider { code: i32, message: String },

    /// The provider answered with something unparseable.
    #[error("invalid model response: {message}")]
    InvalidResponse { message: String },

    /// The requested model is unknown to this client.
    #[error("unknown model: {model}")]
    UnknownModel { model: String },

    /// The client does not implement the requested capability.
    #[error("unsupported model operation: {what}")]
    Unsupported { what: String },
}

/// Descriptive record for one deployable model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model: String,
    /// Context window in tokens, when the provider reports one.
    #[serde(default)]
    pub context_length: Option<u32>,
    /// Whether the chat template accepts a dedicated system role.
    #[serde(default = "default_true")]
    pub supports_system_role: bool,
}

fn default_true() -> bool {
    true
}

/// Stream of partial model outputs.
pub type ModelOutputStream = BoxStream<'static, Result<ModelOutput, ModelError>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion.
    async fn generate(&self, request: &ModelRequest) -> Result<ModelOutput, ModelError>;

    /// Streaming completion. Frames may be incremental deltas or cumulative
    /// snapshots; each frame's `incremental` flag says which.
    async fn generate_stream(
        &self,
        request: &ModelRequest,
    ) -> Result<ModelOutputStream, ModelError>;

    /// Token count of `text` under the tokenizer of `model`.
    async fn count_tokens(&self, model: &str, text: &str) -> Result<u32, ModelError>;

    /// All models this client can serve.
    async fn models(&self) -> Result<Vec<ModelMetadata>, ModelError>;
}

/// TTL cache over [`LlmClient::models`].
pub struct ModelMetadataCache {
    ttl: Duration,
    cached: Mutex<Option<(Instant, Vec<ModelMetadata>)>>,
}

impl Default for ModelMetadataCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ModelMetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Cached model list, refreshed through `client` when stale.
    pub async fn models(&self, client: &dyn LlmClient) -> Result<Vec<ModelMetadata>, ModelError> {
        if let Some((fetched_at, models)) = self.cached.lock().as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(models.clone());
            }
        }
        let models = client.models().await?;
        *self.cached.lock() = Some((Instant::now(), models.clone()));
        Ok(models)
    }

    /// Metadata for one model, or [`ModelError::UnknownModel`].
    pub async fn metadata_for(
        &self,
        client: &dyn LlmClient,
        model: &str,
    ) -> Result<ModelMetadata, ModelError> {
        self.models(client)
            .await?
            .into_iter()
            .find(|m| m.model == model)
            .ok_or_else(|| ModelError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// Drop the cached listing so the next lookup refetches.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
