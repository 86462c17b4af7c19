use std::path::Path;

use anyhow::bail;
use indoc::indoc;

use crate::Config;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    if !config.gateway.enabled {
        let message = indoc! {r#"
            The gateway is disabled. MetaMCP requires the namespace endpoints to serve anything.

            Remove `enabled = false` from the [gateway] section, or set it to true:

              [gateway]
              enabled = true
        "#};

        bail!(message);
    }

    if !config.gateway.path_prefix.starts_with('/') {
        bail!(
            "gateway.path_prefix must start with '/', got '{}'",
            config.gateway.path_prefix
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::Config;

    #[test]
    fn rejects_disabled_gateway() {
        let config: Config = toml::from_str("[gateway]\nenabled = false").unwrap();
        assert!(super::validate(&config).is_err());
    }

    #[test]
    fn rejects_relative_path_prefix() {
        let config: Config = toml::from_str("[gateway]\npath_prefix = \"mcp\"").unwrap();
        assert!(super::validate(&config).is_err());
    }
}
