//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Shared primitives and utilities for the management runtime."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Shared primitives for the portal-manage workspace: configuration loading
//! and tracing setup consumed by the daemon and the core crates.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, BackupConfig, BuildConfig, GitConfig, HistoryConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, StoreConfig, ValidationConfig,
};
pub use logging::{init_tracing, LogFormat};
