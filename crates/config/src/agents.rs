//! Ask-agent LLM configuration settings.

use std::time::Duration;

use duration_str::deserialize_duration;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Ask-agent LLM configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentsConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: Option<Url>,
    /// API key sent as a bearer token.
    pub api_key: Option<SecretString>,
    /// Request timeout for a single chat completion call.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
