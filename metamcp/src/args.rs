use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use clap::{Parser, ValueEnum};
use config::Config;
use logforth::filter::EnvFilter;
use secrecy::SecretString;

/// Command line and environment overrides. Anything set here wins over the
/// TOML configuration file.
#[derive(Debug, Parser)]
#[command(name = "MetaMCP", version, about = "Namespace gateway for MCP servers")]
pub struct Args {
    /// Socket address to listen on. Overrides `server.listen_address`.
    #[arg(short, long, env = "METAMCP_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Path to the TOML configuration file.
    #[arg(long, short, env = "METAMCP_CONFIG_PATH", default_value = "./metamcp.toml")]
    pub config: PathBuf,

    /// URL prefix the namespace endpoints are mounted under. Overrides
    /// `gateway.path_prefix`.
    #[arg(long, env = "METAMCP_PATH_PREFIX")]
    pub path_prefix: Option<String>,

    /// API key for the ask-agent chat provider. Overrides `agents.api_key`,
    /// so the secret can stay out of the config file.
    #[arg(long, env = "METAMCP_AGENTS_API_KEY", hide_env_values = true)]
    pub agents_api_key: Option<String>,

    /// API key for the embedding provider. Overrides
    /// `discovery.embeddings.api_key`. Ignored when no embedding provider
    /// is configured.
    #[arg(long, env = "METAMCP_EMBEDDINGS_API_KEY", hide_env_values = true)]
    pub embeddings_api_key: Option<String>,

    /// Log level for the workspace crates, or a full filter spec such as
    /// "warn,mcp=trace".
    #[arg(long = "log", env = "METAMCP_LOG", default_value = "info")]
    pub log: String,

    /// Log output format.
    #[arg(long, env = "METAMCP_LOG_FORMAT", value_enum, default_value = "auto")]
    pub log_format: LogFormat,
}

impl Args {
    /// The effective configuration: the TOML file (or defaults when it does
    /// not exist) with the flag and environment overrides applied on top.
    pub fn config(&self) -> anyhow::Result<Config> {
        let mut config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };

        if let Some(prefix) = &self.path_prefix {
            if !prefix.starts_with('/') {
                anyhow::bail!("--path-prefix must start with '/', got '{prefix}'");
            }

            config.gateway.path_prefix = prefix.clone();
        }

        if let Some(key) = &self.agents_api_key {
            config.agents.api_key = Some(SecretString::from(key.clone()));
        }

        if let Some(key) = &self.embeddings_api_key
            && let Some(embeddings) = &mut config.discovery.embeddings
        {
            embeddings.api_key = Some(SecretString::from(key.clone()));
        }

        Ok(config)
    }

    /// The log filter. A bare level name fans out to the workspace crates
    /// while keeping dependencies at warn; anything else is taken as a
    /// filter spec verbatim.
    pub fn log_filter(&self) -> EnvFilter {
        let spec = match self.log.as_str() {
            "off" => "off".to_string(),
            level @ ("error" | "warn" | "info" | "debug" | "trace") => format!(
                "warn,metamcp={level},server={level},mcp={level},storage={level},llm={level},config={level}"
            ),
            custom => custom.to_string(),
        };

        EnvFilter::from_str(&spec).unwrap_or_else(|_| {
            eprintln!("Ignoring invalid log filter '{spec}', falling back to 'info'");
            EnvFilter::from_str("info").expect("a bare level is a valid filter")
        })
    }
}

/// How log lines are rendered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Colored text on a terminal, plain text otherwise.
    Auto,
    /// Plain text.
    Plain,
    /// JSON objects.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            listen_address: None,
            config: PathBuf::from("/nonexistent/metamcp.toml"),
            path_prefix: None,
            agents_api_key: None,
            embeddings_api_key: None,
            log: "info".to_string(),
            log_format: LogFormat::Auto,
        }
    }

    #[test]
    fn flags_override_the_config_file() {
        let mut args = args();
        args.path_prefix = Some("/namespaces".to_string());
        args.agents_api_key = Some("sk-test".to_string());

        let config = args.config().unwrap();

        assert_eq!(config.gateway.path_prefix, "/namespaces");
        assert!(config.agents.api_key.is_some());
    }

    #[test]
    fn relative_path_prefix_is_rejected() {
        let mut args = args();
        args.path_prefix = Some("namespaces".to_string());

        assert!(args.config().is_err());
    }

    #[test]
    fn embeddings_key_needs_a_provider() {
        let mut args = args();
        args.embeddings_api_key = Some("sk-embed".to_string());

        // No [discovery.embeddings] section: the override has nothing to
        // attach to and the config stays valid.
        let config = args.config().unwrap();
        assert!(config.discovery.embeddings.is_none());
    }

    #[test]
    fn log_filters_accept_levels_and_specs() {
        let mut args = args();

        for spec in ["off", "debug", "warn,mcp=trace", "metamcp=info"] {
            args.log = spec.to_string();
            // Parsing must not fall back for any of these.
            let _ = args.log_filter();
        }
    }
}
