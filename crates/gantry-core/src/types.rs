use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single chat message in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn content_len(&self) -> usize {
        self.content.as_deref().map_or(0, str::len)
    }
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Gateway extension — pin the request to a specific upstream provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Legacy `POST /v1/completions` body. `prompt` accepts a string or an
/// array of strings (the first element is used).
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: PromptInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Batch(Vec<String>),
}

impl PromptInput {
    pub fn first(&self) -> &str {
        match self {
            Self::Text(s) => s,
            Self::Batch(v) => v.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// Token usage attached to responses and final stream chunks.
///
/// `total_tokens` is always `prompt + completion` — construct through
/// [`UsageReport::new`] to keep the identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageReport {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl UsageReport {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_cost: None,
            request_id: None,
        }
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Streaming delta inside a unified chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// The single on-wire streaming format, regardless of upstream provider:
/// an OpenAI-shaped `chat.completion.chunk`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnifiedChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
}

impl UnifiedChunk {
    fn base(id: &str, model: &str, delta: ChunkDelta, finish_reason: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".into(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// The opening chunk of a stream — assistant role, empty content.
    pub fn role(id: &str, model: &str) -> Self {
        Self::base(
            id,
            model,
            ChunkDelta {
                role: Some("assistant".into()),
                content: Some(String::new()),
                tool_calls: None,
            },
            None,
        )
    }

    pub fn content(id: &str, model: &str, text: impl Into<String>) -> Self {
        Self::base(
            id,
            model,
            ChunkDelta {
                role: None,
                content: Some(text.into()),
                tool_calls: None,
            },
            None,
        )
    }

    pub fn tool_calls(id: &str, model: &str, calls: Vec<serde_json::Value>) -> Self {
        Self::base(
            id,
            model,
            ChunkDelta {
                role: None,
                content: None,
                tool_calls: Some(calls),
            },
            None,
        )
    }

    /// The closing chunk — empty delta, a finish reason, and optionally the
    /// accumulated usage.
    pub fn done(id: &str, model: &str, finish_reason: &str, usage: Option<UsageReport>) -> Self {
        let mut chunk = Self::base(id, model, ChunkDelta::default(), Some(finish_reason.into()));
        chunk.usage = usage;
        chunk
    }
}

/// Non-streaming `chat.completion` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: UsageReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

impl ChatCompletionResponse {
    pub fn assistant(id: &str, model: &str, text: String, finish_reason: &str, usage: UsageReport) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion".into(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage::new("assistant", text),
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage,
        }
    }
}

/// `GET /v1/models` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelObject>,
}

/// `POST /v1/embeddings` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub input: PromptInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Generate a fresh request id, e.g. `req_6fa1c0de…`.
pub fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_identity() {
        let usage = UsageReport::new(12, 30);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn role_chunk_shape() {
        let chunk = UnifiedChunk::role("chatcmpl-1", "gpt-4o");
        assert_eq!(chunk.object, "chat.completion.chunk");
        assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some(""));
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[test]
    fn done_chunk_carries_usage() {
        let usage = UsageReport::new(5, 7);
        let chunk = UnifiedChunk::done("chatcmpl-1", "gpt-4o", "stop", Some(usage.clone()));
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunk.usage, Some(usage));
    }

    #[test]
    fn prompt_input_first() {
        assert_eq!(PromptInput::Text("hi".into()).first(), "hi");
        assert_eq!(PromptInput::Batch(vec!["a".into(), "b".into()]).first(), "a");
        assert_eq!(PromptInput::Batch(vec![]).first(), "");
    }

    #[test]
    fn request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
