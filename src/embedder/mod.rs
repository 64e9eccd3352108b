//! Embedding providers that turn query text into vectors.

pub mod openai;
pub mod qdrant;

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use openai::OpenAiEmbedder;
pub use qdrant::QdrantEmbedder;

/// Maps text to fixed-length vectors. Implementations block on network I/O.
pub trait Embedder: Send + Sync {
    /// Embeds every input, returning vectors in input order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single string.
    fn embed(&self, input: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[input])?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedding provider returned no vector"))
    }
}

/// JSON-over-HTTP transport shared by the providers.
#[derive(Clone)]
pub(crate) struct JsonEndpoint {
    client: Client,
    url: String,
    max_retries: usize,
}

impl JsonEndpoint {
    pub(crate) fn new(
        url: String,
        mut headers: HeaderMap,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "embedding endpoint must be an http(s) URL, got {url}"
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            client,
            url,
            max_retries: max_retries.max(1),
        })
    }

    /// POSTs `body`, retrying throttling, 5xx and transport failures.
    pub(crate) fn post<B, R>(&self, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut attempt = 0usize;
        loop {
            let failure = match self.client.post(&self.url).json(body).send() {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json()
                        .with_context(|| format!("failed to decode response from {}", self.url));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().unwrap_or_default();
                    if !should_retry(status) || attempt + 1 >= self.max_retries {
                        anyhow::bail!("embedding request failed ({status}): {text}");
                    }
                    status.to_string()
                }
                Err(err) => {
                    if !is_transient(&err) || attempt + 1 >= self.max_retries {
                        return Err(err).context("embedding request failed");
                    }
                    err.to_string()
                }
            };
            attempt += 1;
            tracing::warn!(error = %failure, attempt, "embedding request failed; retrying");
            thread::sleep(retry_backoff(attempt));
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

/// Exponential backoff starting at one second, capped at 16 seconds.
fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

/// Errors unless the provider answered once per input.
pub(crate) fn expect_count(vectors: Vec<Vec<f32>>, inputs: usize) -> Result<Vec<Vec<f32>>> {
    anyhow::ensure!(
        vectors.len() == inputs,
        "provider returned {} embeddings for {inputs} inputs",
        vectors.len()
    );
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Embedder for Echo {
        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|s| vec![s.len() as f32]).collect())
        }
    }

    #[test]
    fn single_embed_uses_batch_path() {
        assert_eq!(Echo.embed("abcd").unwrap(), vec![4.0]);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(5), retry_backoff(9));
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn endpoint_requires_http_scheme() {
        let err = JsonEndpoint::new(
            "localhost:8081".into(),
            HeaderMap::new(),
            Duration::from_secs(1),
            1,
        );
        assert!(err.is_err());
        assert!(expect_count(vec![vec![1.0]], 2).is_err());
    }
}
