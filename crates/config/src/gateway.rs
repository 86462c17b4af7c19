//! Gateway (namespace endpoint) configuration settings.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Gateway configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Whether the namespace endpoints are enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// URL prefix under which namespace endpoints are mounted.
    ///
    /// A namespace is reachable at `{path_prefix}/{namespace}/mcp` for
    /// streamable HTTP and `{path_prefix}/{namespace}/sse` for SSE.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// How many times an initial upstream connect is attempted before the
    /// attach fails. Calls are never retried.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Base delay for the exponential backoff between connect attempts.
    #[serde(default = "default_connect_backoff", deserialize_with = "deserialize_duration")]
    pub connect_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path_prefix: default_path_prefix(),
            connect_attempts: default_connect_attempts(),
            connect_backoff: default_connect_backoff(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_path_prefix() -> String {
    "/mcp".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff() -> Duration {
    Duration::from_millis(250)
}
