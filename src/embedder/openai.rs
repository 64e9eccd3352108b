//! Client for OpenAI-compatible `/embeddings` endpoints.
//!
//! Works against OpenAI itself and against self-hosted servers that expose the
//! same route for sentence-transformer models such as `all-MiniLM-L6-v2`.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use super::{expect_count, Embedder, JsonEndpoint};

/// Blocking embeddings client.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    endpoint: JsonEndpoint,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    /// Builds a client. The API key is optional for self-hosted servers.
    pub fn new(
        api_key: Option<&str>,
        base_url: &str,
        model: impl Into<String>,
        dimensions: Option<usize>,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        let model = model.into();
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .context("invalid embedding API key")?;
            headers.insert(AUTHORIZATION, bearer);
        }
        let url = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            endpoint: JsonEndpoint::new(url, headers, timeout, max_retries)?,
            model,
            dimensions,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let response: EmbeddingsReply = self.endpoint.post(&EmbeddingsCall {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        })?;
        expect_count(response.in_input_order(), inputs.len())
    }
}

#[derive(Serialize)]
struct EmbeddingsCall<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsReply {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingsReply {
    fn in_input_order(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|row| row.index);
        self.data.into_iter().map(|row| row.embedding).collect()
    }
}
