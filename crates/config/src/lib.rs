//! MetaMCP configuration structures to map the metamcp.toml configuration.

#![deny(missing_docs)]

mod agents;
mod discovery;
mod gateway;
mod loader;
mod server;

use std::path::Path;

use serde::Deserialize;

pub use agents::AgentsConfig;
pub use discovery::{DiscoveryConfig, EmbeddingsConfig};
pub use gateway::GatewayConfig;
pub use server::{HealthConfig, ServerConfig};

/// Main configuration structure for the MetaMCP gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Gateway (namespace endpoint) configuration settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Smart discovery configuration settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Ask-agent LLM configuration settings.
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }
}

#[cfg(test)]
mod tests {
    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert!(config.server.listen_address.is_none());
        assert!(config.server.health.enabled);
        assert_eq!(config.server.health.path, "/health");
        assert!(config.gateway.enabled);
        assert_eq!(config.gateway.path_prefix, "/mcp");
        assert!(config.discovery.embeddings.is_none());
        assert!(config.agents.api_key.is_none());
        assert_eq!(config.agents.timeout.as_secs(), 30);
    }

    #[test]
    fn gateway_section() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            enabled = false
            path_prefix = "/namespaces"
            "#,
        )
        .unwrap();

        assert!(!config.gateway.enabled);
        assert_eq!(config.gateway.path_prefix, "/namespaces");
    }

    #[test]
    fn discovery_embeddings() {
        let config: Config = toml::from_str(
            r#"
            [discovery.embeddings]
            base_url = "http://localhost:8081/v1"
            model = "text-embedding-3-small"
            "#,
        )
        .unwrap();

        let embeddings = config.discovery.embeddings.unwrap();
        assert_eq!(embeddings.model, "text-embedding-3-small");
        assert_eq!(embeddings.base_url.as_str(), "http://localhost:8081/v1");
    }

    #[test]
    fn agents_timeout_as_string() {
        let config: Config = toml::from_str(
            r#"
            [agents]
            timeout = "45s"
            "#,
        )
        .unwrap();

        assert_eq!(config.agents.timeout.as_secs(), 45);
    }

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [gateway]
            nonsense = true
            "#,
        );

        assert!(result.is_err());
    }
}
