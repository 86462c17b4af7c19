//! Optional helper that installs upstream server packages on the host.
//!
//! Disabled unless the gating environment variable is truthy. Every run is
//! recorded as an append-only audit row; the core never reads those back.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use storage::{PackageInstallRecord, Storage};
use tokio::process::Command;

use crate::error::GatewayError;

/// Environment variable that must be `1` or `true` for installs to run.
pub const INSTALL_ENV_FLAG: &str = "METAMCP_ALLOW_PACKAGE_INSTALL";

static PACKAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@/._-]+$").expect("the package name pattern is valid"));

/// Supported package managers and their install invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// `npm install -g <package>`
    Npm,
    /// `apt-get install -y <package>`
    Apt,
    /// `pip install <package>`
    Pip,
    /// `uv pip install <package>`
    Uv,
}

impl PackageManager {
    fn command(self, package: &str) -> (String, Vec<String>) {
        match self {
            Self::Npm => ("npm".to_string(), vec!["install".into(), "-g".into(), package.into()]),
            Self::Apt => (
                "apt-get".to_string(),
                vec!["install".into(), "-y".into(), package.into()],
            ),
            Self::Pip => ("pip".to_string(), vec!["install".into(), package.into()]),
            Self::Uv => ("uv".to_string(), vec!["pip".into(), "install".into(), package.into()]),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Apt => "apt",
            Self::Pip => "pip",
            Self::Uv => "uv",
        }
    }
}

/// Runs gated package installs and writes the audit trail.
pub struct PackageInstaller {
    storage: Arc<dyn Storage>,
}

impl PackageInstaller {
    /// An installer writing audit rows through the given store.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn enabled() -> bool {
        matches!(
            std::env::var(INSTALL_ENV_FLAG).as_deref(),
            Ok("1") | Ok("true") | Ok("TRUE")
        )
    }

    /// Install a package. Refuses to run unless the env flag is set and the
    /// package name matches the conservative character class.
    pub async fn install(
        &self,
        manager: PackageManager,
        package: &str,
        user_id: Option<&str>,
    ) -> Result<String, GatewayError> {
        if !Self::enabled() {
            return Err(GatewayError::Authorization(format!(
                "package installs are disabled; set {INSTALL_ENV_FLAG}=1 to enable them"
            )));
        }

        if !PACKAGE_NAME.is_match(package) {
            return Err(GatewayError::Validation(format!(
                "invalid package name '{package}': only [A-Za-z0-9@/._-] is allowed"
            )));
        }

        let (program, args) = manager.command(package);
        let command_line = format!("{program} {}", args.join(" "));

        log::info!("Running package install: {command_line}");

        let output = Command::new(&program)
            .args(&args)
            .output()
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to spawn '{program}': {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let status = if output.status.success() { "success" } else { "failure" };

        let record = PackageInstallRecord {
            manager: manager.name().to_string(),
            package_name: package.to_string(),
            command: command_line.clone(),
            output: combined.clone(),
            status: status.to_string(),
            user_id: user_id.map(str::to_string),
            created_at: jiff::Timestamp::now(),
        };

        if let Err(e) = self.storage.append_install_record(record).await {
            log::error!("Failed to record package install audit row: {e}");
        }

        if output.status.success() {
            Ok(combined)
        } else {
            Err(GatewayError::Internal(format!(
                "install command '{command_line}' failed: {combined}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    #[test]
    fn package_name_class_is_conservative() {
        assert!(PACKAGE_NAME.is_match("@scope/package-name_1.2"));
        assert!(PACKAGE_NAME.is_match("requests"));
        assert!(!PACKAGE_NAME.is_match("rm -rf /"));
        assert!(!PACKAGE_NAME.is_match("pkg;echo"));
        assert!(!PACKAGE_NAME.is_match(""));
    }

    #[test]
    fn install_commands_match_the_managers() {
        assert_eq!(
            PackageManager::Npm.command("left-pad"),
            ("npm".to_string(), vec!["install".to_string(), "-g".to_string(), "left-pad".to_string()])
        );
        assert_eq!(
            PackageManager::Uv.command("httpx"),
            ("uv".to_string(), vec!["pip".to_string(), "install".to_string(), "httpx".to_string()])
        );
    }

    #[tokio::test]
    async fn refuses_without_the_env_flag() {
        // The flag is not set in the test environment.
        let installer = PackageInstaller::new(Arc::new(MemoryStorage::new()));

        let err = installer.install(PackageManager::Pip, "requests", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }
}
