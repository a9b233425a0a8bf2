//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Tracing subscriber setup for the management daemon."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "MANAGE_LOG";

/// Request spans from the HTTP layer are noisy at info.
const QUIET_DEPENDENCIES: &str = "tower_http=warn,hyper=warn";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for the daemon's stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Pick the filter directive: `MANAGE_LOG`, then `RUST_LOG`, then the
/// configured level. Dependency noise is appended unless the directive
/// already mentions those crates.
fn resolve_directive(manage_log: Option<&str>, rust_log: Option<&str>, level: &str) -> String {
    let base = [manage_log, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(level);
    if base.contains("tower_http") || base.contains("hyper") {
        base.to_owned()
    } else {
        format!("{base},{QUIET_DEPENDENCIES}")
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let manage_log = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = resolve_directive(manage_log.as_deref(), rust_log.as_deref(), &config.level);
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log directive `{directive}` ({err}); falling back to info");
        EnvFilter::new(format!("info,{QUIET_DEPENDENCIES}"))
    })
}

/// Install the global subscriber.
///
/// Stdout gets JSON or pretty output per `LoggingConfig::format`. Unless
/// `file` is disabled, a daily rolling JSON file under `directory` keeps build
/// and restore records after the process exits. Calling this twice is a no-op.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let mut guards = Vec::with_capacity(2);

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("failed to create log directory {}", config.directory.display())
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(build_filter(config))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(guards);
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            file = config.file,
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manage_log_wins_over_rust_log() {
        let directive = resolve_directive(Some("manage_core=debug"), Some("trace"), "info");
        assert_eq!(directive, "manage_core=debug,tower_http=warn,hyper=warn");
    }

    #[test]
    fn blank_overrides_fall_through_to_level() {
        let directive = resolve_directive(Some("  "), None, "warn");
        assert_eq!(directive, "warn,tower_http=warn,hyper=warn");
    }

    #[test]
    fn explicit_http_directives_are_kept() {
        let directive = resolve_directive(None, Some("info,tower_http=debug"), "info");
        assert_eq!(directive, "info,tower_http=debug");
    }
}
