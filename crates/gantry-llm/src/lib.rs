//! # gantry-llm
//!
//! Provider abstraction layer for the Gantry gateway: the [`ChatProvider`]
//! trait and its OpenAI / Anthropic / mock adapters, embeddings, the
//! response transformer, token estimation, and the cost table.

pub mod anthropic;
pub mod cost;
pub mod embedding;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod tokens;
pub mod transform;

pub use anthropic::AnthropicProvider;
pub use cost::{CostTable, ModelMeta};
pub use embedding::{DEFAULT_DIMENSIONS, EmbeddingProvider, MockEmbedding, OpenAiEmbedding};
pub use mock::{MockChatProvider, MockFailure, MockResponse};
pub use openai::OpenAiProvider;
pub use provider::{ChatProvider, ProviderEvent, ProviderInfo, ProviderRequest, ProviderResponse};
pub use registry::ProviderRegistry;
