//! Qdrant Cloud Inference client (e.g. model `qdrant/all-MiniLM-L6-v2`).

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{expect_count, Embedder, JsonEndpoint};

/// Blocking client for a Qdrant `/inference/text` endpoint.
#[derive(Clone)]
pub struct QdrantEmbedder {
    endpoint: JsonEndpoint,
    model: String,
}

impl QdrantEmbedder {
    /// `endpoint` is the full inference URL; `api_key` goes in the `api-key` header.
    pub fn new(
        api_key: &str,
        endpoint: &str,
        model: impl Into<String>,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        let model = model.into();
        anyhow::ensure!(!api_key.trim().is_empty(), "Qdrant inference needs an API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key.trim()).context("invalid Qdrant API key")?;
        headers.insert("api-key", key);
        let url = endpoint.trim_end_matches('/').to_string();
        Ok(Self {
            endpoint: JsonEndpoint::new(url, headers, timeout, max_retries)?,
            model,
        })
    }
}

impl Embedder for QdrantEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let reply: InferenceReply = self.endpoint.post(&InferenceCall {
            model: &self.model,
            input: inputs,
        })?;
        expect_count(reply.vectors()?, inputs.len())
    }
}

#[derive(Serialize)]
struct InferenceCall<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

/// Either `data: [{embedding, index}]` or a bare `embeddings` matrix.
#[derive(Debug, Deserialize)]
struct InferenceReply {
    #[serde(default)]
    data: Vec<InferenceRow>,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct InferenceRow {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl InferenceReply {
    fn vectors(mut self) -> Result<Vec<Vec<f32>>> {
        if !self.data.is_empty() {
            self.data.sort_by_key(|row| row.index);
            return Ok(self.data.into_iter().map(|row| row.embedding).collect());
        }
        anyhow::ensure!(
            !self.embeddings.is_empty(),
            "inference reply carried no embeddings"
        );
        Ok(self.embeddings)
    }
}
