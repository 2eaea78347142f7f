//! # gantry-core
//!
//! Core types for the Gantry gateway: the unified error type and envelope,
//! the OpenAI-shaped wire structs shared by every crate, and the telemetry
//! bus.

pub mod error;
pub mod telemetry;
pub mod types;

pub use error::{ErrorBody, ErrorEnvelope, GatewayError, Result};
pub use telemetry::{TelemetryBus, TelemetryEvent, mask_key};
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChunkChoice, ChunkDelta,
    CompletionChoice, CompletionRequest, EmbeddingRequest, ModelList, ModelObject, PromptInput,
    UnifiedChunk, UsageReport, new_request_id,
};
