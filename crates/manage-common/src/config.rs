//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Shared primitives and utilities for the management runtime."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_store_path() -> PathBuf {
    PathBuf::from("manage.json")
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("var/backups")
}

fn default_history_path() -> PathBuf {
    PathBuf::from("var/history/jobs.log")
}

fn default_build_timeout() -> Duration {
    Duration::from_secs(1800)
}

fn default_build_shell() -> String {
    "sh".to_owned()
}

fn default_max_log_bytes() -> usize {
    256 * 1024
}

fn default_git_binary() -> String {
    "git".to_owned()
}

fn default_git_remote() -> String {
    "origin".to_owned()
}

fn default_git_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_supervisorctl() -> String {
    "supervisorctl".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("var/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8090))
}

/// Primary configuration object for the management daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "MANAGE_CONFIG";

    /// Load configuration from disk together with the effective source path,
    /// respecting the `MANAGE_CONFIG` override.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.store.path.as_os_str().is_empty() {
            return Err(anyhow!("store.path must not be empty"));
        }
        if self.backups.retain_last == Some(0) {
            return Err(anyhow!(
                "backups.retain_last must keep at least one backup when set"
            ));
        }
        self.build.validate()?;
        self.git.validate()?;
        if self.api.enabled && self.metrics.enabled && self.api.listen == self.metrics.listen {
            return Err(anyhow!(
                "api and metrics listeners cannot share address {}",
                self.api.listen
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Location of the portal/REST record file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_directory")]
    pub directory: PathBuf,
    /// Prune the oldest backups of a portal after each snapshot. Unset keeps everything.
    #[serde(default)]
    pub retain_last: Option<usize>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_directory(),
            retain_last: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_build_shell")]
    pub shell: String,
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
    #[serde(default = "default_supervisorctl")]
    pub supervisorctl: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout: default_build_timeout(),
            shell: default_build_shell(),
            max_log_bytes: default_max_log_bytes(),
            supervisorctl: default_supervisorctl(),
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("build.timeout must be greater than zero"));
        }
        if self.shell.trim().is_empty() {
            return Err(anyhow!("build.shell must not be empty"));
        }
        if self.max_log_bytes == 0 {
            return Err(anyhow!("build.max_log_bytes must be greater than zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_binary")]
    pub binary: String,
    #[serde(default = "default_git_remote")]
    pub remote: String,
    #[serde(default = "default_git_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            remote: default_git_remote(),
            timeout: default_git_timeout(),
        }
    }
}

impl GitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("git.timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Record validation switches.
///
/// Filesystem checks always run. Toolchain checks shell out to `nvm` and
/// `supervisorctl` and are disabled by default so records can be managed on
/// hosts where those tools are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub check_toolchains: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directive used when neither `MANAGE_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write the rolling JSON log file next to stdout output.
    #[serde(default = "default_log_file")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.store.path, PathBuf::from("manage.json"));
        assert_eq!(config.build.timeout, Duration::from_secs(1800));
        assert_eq!(config.git.remote, "origin");
        assert!(config.backups.retain_last.is_none());
        assert!(!config.validation.check_toolchains);
    }

    #[test]
    fn durations_are_read_as_seconds() {
        let config: AppConfig = r#"
            [build]
            timeout = 90

            [git]
            timeout = 5
            remote = "upstream"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.build.timeout, Duration::from_secs(90));
        assert_eq!(config.git.timeout, Duration::from_secs(5));
        assert_eq!(config.git.remote, "upstream");
    }

    #[test]
    fn zero_retention_is_rejected() {
        let err = "[backups]\nretain_last = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("retain_last"));
    }

    #[test]
    fn shared_listener_is_rejected() {
        let err = r#"
            [api]
            listen = "127.0.0.1:7000"

            [metrics]
            listen = "127.0.0.1:7000"
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("cannot share"));
    }

    #[test]
    fn load_with_source_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("manage.toml");
        fs::write(&present, "[store]\npath = \"/srv/manage.json\"\n").unwrap();

        let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.store.path, PathBuf::from("/srv/manage.json"));
    }
}
