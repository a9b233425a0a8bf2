//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "binary"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Binary entrypoint for the management daemon."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use manage_api::{spawn_api_server, ApiServer, ApiState};
use manage_common::{init_tracing, AppConfig};
use manage_core::{ConfigStore, JsonConfigStore, Orchestrator, TargetKind};
use manage_metrics::{new_registry, spawn_http_server, DaemonMetrics, ManageMetrics};
use tokio::signal;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(author, version, about = "Portal and REST service management daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the orchestrator and API server")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "Print configured targets from the record store")]
    Targets {
        #[arg(long, value_enum)]
        kind: Option<CliKind>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliKind {
    Portal,
    Rest,
}

impl From<CliKind> for TargetKind {
    fn from(value: CliKind) -> Self {
        match value {
            CliKind::Portal => TargetKind::Portal,
            CliKind::Rest => TargetKind::Rest,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/manage.toml"));
    candidates.push(PathBuf::from("configs/manage.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("managed", &config.logging)?;
            info!(source = %loaded.source.display(), "configuration loaded");
            run_daemon(config).await?
        }
        Commands::CheckConfig => {
            println!(
                "Configuration: {}\nStore: {}\nBackups: {}\nHistory: {}\nAPI: {} ({})\nMetrics: {} ({})",
                loaded.source.display(),
                config.store.path.display(),
                config.backups.directory.display(),
                config.history.path.display(),
                config.api.listen,
                enabled(config.api.enabled),
                config.metrics.listen,
                enabled(config.metrics.enabled),
            );
        }
        Commands::Targets { kind } => {
            let store = JsonConfigStore::open(&config.store.path)?;
            let kinds = match kind {
                Some(kind) => vec![kind.into()],
                None => vec![TargetKind::Portal, TargetKind::Rest],
            };
            for kind in kinds {
                for target in store.list(kind)? {
                    println!(
                        "{}\t{}\t{}",
                        target.key(),
                        target.spec.path(),
                        target.revision.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(VERSION);

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };
    let metrics = ManageMetrics::new(registry)?;

    let orchestrator = Orchestrator::from_config(&config, Some(metrics))?;

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(orchestrator.clone(), VERSION));
        match spawn_api_server(state, config.api.listen) {
            Ok(server) => api_server = Some(server),
            Err(err) => warn!(error = %err, "failed to start api server"),
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!(version = VERSION, "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    orchestrator.shutdown().await;

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}
