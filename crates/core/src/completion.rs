//! CompletionService trait: the abstraction over text-completion backends.
//!
//! A CompletionService takes a request plus the profile the router picked
//! for it and returns the generated text together with token and latency
//! accounting. Concrete backends live outside this workspace; the engine
//! only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CompletionError;
use crate::tool::{ToolCall, ToolSignature};

/// Backend tier a profile targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    /// Cheap, low-latency model
    Fast,
    /// General purpose model
    Standard,
    /// Most capable (and most expensive) model
    Advanced,
}

/// An execution profile: which backend tier and which parameters to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionProfile {
    /// Profile name as referenced by routing rules (e.g., "fast", "smart")
    pub name: String,

    /// Backend tier
    pub tier: BackendTier,

    /// Model identifier passed through to the backend
    pub model: String,

    /// Temperature (0.0 = deterministic)
    #[serde(default)]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Request-level timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

impl CompletionProfile {
    pub fn new(name: impl Into<String>, tier: BackendTier, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier,
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            request_timeout_ms: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// What the caller wants generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Optional system instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The prompt text
    pub prompt: String,

    /// Tools the backend may ask to call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSignature>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSignature>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete response from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text
    pub content: String,

    /// Tool calls the backend requested instead of (or alongside) text
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Token usage statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Wall-clock latency reported by the backend, in milliseconds
    #[serde(default)]
    pub latency_ms: u64,

    /// Which model actually responded
    pub model: String,
}

impl Completion {
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: None,
            latency_ms: 0,
            model: model.into(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage.map_or(0, |u| u64::from(u.total_tokens))
    }
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The boundary every component calls to obtain a completion.
///
/// Implementations must honour the profile's request-level timeout
/// themselves; the engine additionally enforces it around each call.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Send a request and wait for the complete response.
    async fn complete(
        &self,
        request: CompletionRequest,
        profile: &CompletionProfile,
    ) -> std::result::Result<Completion, CompletionError>;

    /// Send a request and receive the response as a stream of chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: CompletionRequest,
        profile: &CompletionProfile,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<CompletionChunk, CompletionError>>,
        CompletionError,
    > {
        let completion = self.complete(request, profile).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(CompletionChunk {
                content: Some(completion.content),
                done: true,
                usage: completion.usage,
            }))
            .await;
        Ok(rx)
    }
}

/// Start a completion without waiting for it.
///
/// The returned handle resolves to the same result `complete()` would give.
pub fn spawn_completion(
    service: Arc<dyn CompletionService>,
    request: CompletionRequest,
    profile: CompletionProfile,
) -> tokio::task::JoinHandle<std::result::Result<Completion, CompletionError>> {
    tokio::spawn(async move { service.complete(request, &profile).await })
}
