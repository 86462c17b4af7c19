//! Smart discovery configuration settings.

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Smart discovery configuration settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Embedding provider used to index and search tools.
    ///
    /// When absent, smart discovery namespaces fall back to serving their
    /// full tool list.
    pub embeddings: Option<EmbeddingsConfig>,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingsConfig {
    /// Base URL of an OpenAI-compatible embeddings API.
    pub base_url: Url,
    /// API key sent as a bearer token. Optional for local providers.
    pub api_key: Option<SecretString>,
    /// Model identifier passed to the provider.
    pub model: String,
}
