use async_trait::async_trait;
use gantry_core::Result;
use tracing::debug;

use crate::openai::{transport_error, upstream_error};

/// Default dimensionality used by the mock embedder and advertised when no
/// upstream embedding model is configured.
pub const DEFAULT_DIMENSIONS: usize = 1536;

/// Trait for generating text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// The dimensionality of the output embeddings.
    fn dimensions(&self) -> usize;

    /// Provider name.
    fn name(&self) -> &str;
}

/// OpenAI embeddings provider (text-embedding-3-small, -large, etc.)
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedding {
    /// text-embedding-3-small, 1536 dims.
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            dims: DEFAULT_DIMENSIONS,
        }
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!(model = %self.model, count = texts.len(), "generating embeddings");

        let body = serde_json::json!({
            "model": &self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(upstream_error(status.as_u16(), &text));
        }

        let data: serde_json::Value = resp.json().await.map_err(transport_error)?;

        let embeddings: Vec<Vec<f32>> = data["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item["embedding"].as_array().map(|arr| {
                            arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Deterministic offline embedder used in mock mode. The vector is a pure
/// function of the input text, so repeated calls agree.
pub struct MockEmbedding {
    dims: usize,
}

impl MockEmbedding {
    pub fn new() -> Self {
        Self {
            dims: DEFAULT_DIMENSIONS,
        }
    }

    pub fn with_dimensions(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let seed: u64 = text.bytes().map(u64::from).sum::<u64>().wrapping_add(text.len() as u64);
                (0..self.dims)
                    .map(|i| {
                        let v = seed.wrapping_mul(31).wrapping_add(i as u64 * 7919) % 2000;
                        (v as f32 / 1000.0) - 1.0
                    })
                    .collect()
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedding_is_deterministic() {
        let embedder = MockEmbedding::new();
        let a = embedder.embed(&["hello"]).await.unwrap();
        let b = embedder.embed(&["hello"]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), DEFAULT_DIMENSIONS);
    }

    #[tokio::test]
    async fn different_inputs_differ() {
        let embedder = MockEmbedding::with_dimensions(8);
        let out = embedder.embed(&["hello", "world!"]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_ne!(out[0], out[1]);
    }

    #[tokio::test]
    async fn values_stay_in_unit_range() {
        let embedder = MockEmbedding::with_dimensions(32);
        let out = embedder.embed(&["range check"]).await.unwrap();
        assert!(out[0].iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
