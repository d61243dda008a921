//! Model request and output types shared by operators and clients.
//!
//! [`ModelRequest`] is the provider-neutral request envelope an LLM
//! operator hands to an [`client::LlmClient`]; [`ModelOutput`] is the
//! provider-neutral answer, a list of [`MediaContent`] parts plus an error
//! code so failures can travel through the same channel as successes.

pub mod client;
pub mod convert;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Human,
    Ai,
    Tool,
}

/// One message in a model conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: String,
    /// Conversation round this message belongs to; 0 for out-of-band
    /// messages such as standalone system prompts.
    #[serde(default)]
    pub round_index: u32,
    /// Whether this message is sent to the model at all. History rows kept
    /// only for display set this to `false`.
    #[serde(default = "default_true")]
    pub pass_to_model: bool,
}

fn default_true() -> bool {
    true
}

impl ModelMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            round_index: 0,
            pass_to_model: true,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(Role::Ai, content)
    }

    #[must_use]
    pub fn with_round(mut self, round_index: u32) -> Self {
        self.round_index = round_index;
        self
    }
}

/// Kind of one content part in a model output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Thinking,
    Image,
    Audio,
    Video,
}

/// One content part: a kind tag plus its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaContent {
    pub kind: MediaKind,
    pub data: Value,
}

impl MediaContent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Text,
            data: Value::String(content.into()),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Thinking,
            data: Value::String(content.into()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        self.data.as_str()
    }
}

/// Token accounting reported by a provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Provider-neutral model answer.
///
/// Failures travel through the same type: a non-zero `error_code` with the
/// message in the text part. During streaming, `incremental` tells
/// consumers whether each frame is a delta or a cumulative snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    #[serde(default)]
    pub content: Vec<MediaContent>,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Provider-side timing and throughput numbers, passed through
    /// untouched.
    #[serde(default)]
    pub metrics: FxHashMap<String, Value>,
}

impl ModelOutput {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![MediaContent::text(text)],
            ..Default::default()
        }
    }

    pub fn failure(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            content: vec![MediaContent::text(message)],
            error_code,
            ..Default::default()
        }
    }

    pub fn has_error(&self) -> bool {
        self.error_code != 0
    }

    /// Last text part, if any.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .rev()
            .find(|c| c.kind == MediaKind::Text)
            .and_then(MediaContent::as_text)
    }

    /// Last thinking part, if any.
    pub fn thinking(&self) -> Option<&str> {
        self.content
            .iter()
            .rev()
            .find(|c| c.kind == MediaKind::Thinking)
            .and_then(MediaContent::as_text)
    }

    /// Text with any thinking content prepended in a `<thinking>` block.
    pub fn gen_text_with_thinking(&self) -> String {
        let text = self.text().unwrap_or_default();
        match self.thinking() {
            Some(thinking) => {
                format!("<thinking>\n{thinking}\n</thinking>\n{text}")
            }
            None => text.to_string(),
        }
    }
}

/// Call-scoped request context travelling alongside the messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequestContext {
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub conv_uid: Option<String>,
    #[serde(default)]
    pub extra: FxHashMap<String, Value>,
}

/// Provider-neutral model request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ModelMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub context: ModelRequestContext,
}

/// Error raised when a request is assembled inconsistently.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("model name must not be empty")]
    MissingModel,

    #[error("request needs at least one message")]
    NoMessages,
}

impl ModelRequest {
    pub fn builder(model: impl Into<String>) -> ModelRequestBuilder {
        ModelRequestBuilder {
            request: ModelRequest {
                model: model.into(),
                messages: Vec::new(),
                temperature: None,
                top_p: None,
                max_new_tokens: None,
                stop: None,
                stream: false,
                context: ModelRequestContext::default(),
            },
        }
    }

    /// Single human-turn request, the common case in tests and demos.
    pub fn from_prompt(
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<Self, RequestError> {
        ModelRequest::builder(model)
            .message(ModelMessage::human(prompt))
            .build()
    }
}

/// Builder keeping `stream` and `context.stream` in lockstep.
pub struct ModelRequestBuilder {
    request: ModelRequest,
}

impl ModelRequestBuilder {
    #[must_use]
    pub fn message(mut self, message: ModelMessage) -> Self {
        self.request.messages.push(message);
        self
    }

    #[must_use]
    pub fn messages(mut self, messages: impl IntoIterator<Item = ModelMessage>) -> Self {
        self.request.messages.extend(messages);
        self
    }

    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.request.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.request.top_p = Some(top_p);
        self
    }

    #[must_use]
    pub fn max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.request.max_new_tokens = Some(max_new_tokens);
        self
    }

    #[must_use]
    pub fn stop(mut self, stop: Vec<String>) -> Self {
        self.request.stop = Some(stop);
        self
    }

    /// Set the streaming flag on both the request and its context.
    #[must_use]
    pub fn stream(mut self, stream: bool) -> Self {
        self.request.stream = stream;
        self.request.context.stream = stream;
        self
    }

    #[must_use]
    pub fn conv_uid(mut self, conv_uid: impl Into<String>) -> Self {
        self.request.context.conv_uid = Some(conv_uid.into());
        self
    }

    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.request.context.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<ModelRequest, RequestError> {
        if self.request.model.is_empty() {
            return Err(RequestError::MissingModel);
        }
        if self.request.messages.is_empty() {
            return Err(RequestError::NoMessages);
        }
        debug_assert_eq!(self.request.stream, self.request.context.stream);
        Ok(self.request)
    }
}
