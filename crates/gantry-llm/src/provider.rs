use async_trait::async_trait;
use gantry_core::{ChatCompletionRequest, ChatMessage, Result};
use serde::{Deserialize, Serialize};

/// A request handed to a provider after routing — the logical model has
/// already been resolved to this provider's concrete model name.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<serde_json::Value>>,
    pub stop: Option<serde_json::Value>,
    pub user: Option<String>,
}

impl ProviderRequest {
    /// Build from an incoming chat request with the routed model substituted.
    pub fn from_chat(req: &ChatCompletionRequest, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: req.messages.clone(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            tools: req.tools.clone(),
            stop: req.stop.clone(),
            user: req.user.clone(),
        }
    }
}

/// A complete (non-streaming) provider response, still carrying the
/// provider-native finish reason.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub tool_calls: Vec<serde_json::Value>,
    /// Native finish reason ("stop", "end_turn", "MAX_TOKENS", ...).
    pub finish_reason: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One event of a provider stream, normalized across wire formats but not
/// yet translated into the unified chunk shape.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Content text delta.
    TextDelta(String),
    /// An OpenAI-shaped tool call (or tool call delta) value.
    ToolCall(serde_json::Value),
    /// Server-reported usage, sent near the end of the stream.
    Usage { prompt_tokens: u32, completion_tokens: u32 },
    /// Stream finished; carries the provider-native finish reason.
    Done { finish_reason: Option<String> },
    /// An error occurred mid-stream.
    Error { code: String, message: String },
}

/// Static metadata describing a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    /// Wire-format family: "openai", "anthropic", or "mock".
    pub family: String,
    pub default_model: String,
    pub models: Vec<String>,
}

/// Trait implemented by each upstream provider adapter.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Registry name, e.g. "openai", "anthropic".
    fn name(&self) -> &str;

    /// Static provider metadata.
    fn info(&self) -> ProviderInfo;

    /// Models this provider serves.
    fn models(&self) -> Vec<String>;

    fn default_model(&self) -> String {
        self.info().default_model
    }

    fn supports(&self, model: &str) -> bool {
        self.models().iter().any(|m| m == model)
    }

    /// Check the adapter's configuration (key present, base URL sane).
    fn validate_config(&self) -> Result<()>;

    /// Send a non-streaming request.
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse>;

    /// Send a streaming request. Returns a receiver for normalized events.
    async fn stream(&self, request: &ProviderRequest)
    -> Result<tokio::sync::mpsc::Receiver<ProviderEvent>>;

    /// Check if this provider is healthy / reachable.
    async fn health_check(&self) -> Result<()>;
}
