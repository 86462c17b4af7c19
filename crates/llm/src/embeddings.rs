use async_trait::async_trait;
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::LlmError;

/// The embedding provider port.
///
/// Vectors are normalized to unit length and have a fixed dimension per
/// provider, so cosine similarity can be computed directly on the stored
/// float arrays.
#[async_trait]
pub trait Embeddings: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>>;
}

/// Configuration for [`HttpEmbeddings`].
#[derive(Debug, Clone)]
pub struct HttpEmbeddingsConfig {
    /// Base URL of an OpenAI-compatible embeddings API.
    pub base_url: String,
    /// Bearer token. Optional for local providers.
    pub api_key: Option<SecretString>,
    /// Model identifier passed to the provider.
    pub model: String,
}

/// Embedding provider backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddings {
    client: Client,
    config: HttpEmbeddingsConfig,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl HttpEmbeddings {
    /// Creates a provider from the given configuration.
    pub fn new(config: HttpEmbeddingsConfig) -> crate::Result<Self> {
        let client = Client::builder().build().map_err(|e| {
            log::error!("Failed to create HTTP client for embeddings: {e}");
            LlmError::InternalError(None)
        })?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Embeddings for HttpEmbeddings {
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));

        let body = EmbeddingsRequest {
            model: &self.config.model,
            input: [text],
        };

        let mut request = self.client.post(&url).json(&body);

        if let Some(key) = &self.config.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("Failed to reach embeddings API: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Embeddings API error ({status}): {error_text}");

            return Err(LlmError::from_status(status.as_u16(), error_text));
        }

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read embeddings response body: {e}");
            LlmError::InternalError(None)
        })?;

        let parsed: EmbeddingsResponse = sonic_rs::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse embeddings response: {e}");
            LlmError::InternalError(None)
        })?;

        let mut vector = parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| LlmError::InvalidResponse("embeddings response contained no data".to_string()))?;

        normalize(&mut vector);

        Ok(vector)
    }
}

/// Scale a vector to unit length. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();

    if magnitude > f32::EPSILON {
        for value in vector {
            *value /= magnitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::normalize;

    #[test]
    fn normalize_scales_to_unit_length() {
        let mut vector = vec![3.0, 4.0];
        normalize(&mut vector);

        let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-6);
        assert!((vector[0] - 0.6).abs() < 1e-6);
        assert!((vector[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut vector = vec![0.0, 0.0, 0.0];
        normalize(&mut vector);

        assert_eq!(vector, vec![0.0, 0.0, 0.0]);
    }
}
