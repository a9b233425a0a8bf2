//! ---
//! manage_section: "03-persistence-logging"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Metrics collection and export utilities."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "managed_starts_total",
            "Total number of times the management daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "managed_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }
}

/// Build, restore, and backup activity recorded by the orchestrator.
#[derive(Clone)]
pub struct ManageMetrics {
    jobs_started: IntCounterVec,
    jobs_finished: IntCounterVec,
    job_duration: HistogramVec,
    jobs_active: IntGaugeVec,
    conflicts: IntCounterVec,
    backups: IntCounterVec,
}

impl ManageMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let jobs_started = IntCounterVec::new(
            Opts::new(
                "manage_jobs_started_total",
                "Build and restore jobs accepted, by target kind and job kind",
            ),
            &["target_kind", "job_kind"],
        )?;
        registry.register(Box::new(jobs_started.clone()))?;

        let jobs_finished = IntCounterVec::new(
            Opts::new(
                "manage_jobs_finished_total",
                "Build and restore jobs reaching a terminal state",
            ),
            &["target_kind", "job_kind", "status"],
        )?;
        registry.register(Box::new(jobs_finished.clone()))?;

        let buckets = prometheus::exponential_buckets(0.5, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "manage_job_duration_seconds",
                "Wall-clock time from job acceptance to its terminal state",
            )
            .buckets(buckets),
            &["target_kind", "job_kind"],
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        let jobs_active = IntGaugeVec::new(
            Opts::new(
                "manage_jobs_active",
                "Jobs currently holding a target, by target kind",
            ),
            &["target_kind"],
        )?;
        registry.register(Box::new(jobs_active.clone()))?;

        let conflicts = IntCounterVec::new(
            Opts::new(
                "manage_conflicts_total",
                "Requests rejected because the target was busy",
            ),
            &["target_kind"],
        )?;
        registry.register(Box::new(conflicts.clone()))?;

        let backups = IntCounterVec::new(
            Opts::new(
                "manage_backups_total",
                "Backup snapshot attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(backups.clone()))?;

        Ok(Self {
            jobs_started,
            jobs_finished,
            job_duration,
            jobs_active,
            conflicts,
            backups,
        })
    }

    pub fn record_job_started(&self, target_kind: &str, job_kind: &str) {
        self.jobs_started
            .with_label_values(&[target_kind, job_kind])
            .inc();
        self.jobs_active.with_label_values(&[target_kind]).inc();
    }

    pub fn record_job_finished(
        &self,
        target_kind: &str,
        job_kind: &str,
        status: &str,
        seconds: f64,
    ) {
        self.jobs_finished
            .with_label_values(&[target_kind, job_kind, status])
            .inc();
        self.job_duration
            .with_label_values(&[target_kind, job_kind])
            .observe(seconds);
        self.jobs_active.with_label_values(&[target_kind]).dec();
    }

    pub fn record_conflict(&self, target_kind: &str) {
        self.conflicts.with_label_values(&[target_kind]).inc();
    }

    pub fn record_backup(&self, succeeded: bool) {
        let outcome = if succeeded { "created" } else { "failed" };
        self.backups.with_label_values(&[outcome]).inc();
    }
}

impl std::fmt::Debug for ManageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManageMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_total(registry: &Registry, name: &str) -> f64 {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|metric| metric.get_counter().get_value())
                    .sum()
            })
            .unwrap_or_default()
    }

    #[test]
    fn job_lifecycle_updates_counters_and_gauge() {
        let registry = new_registry();
        let metrics = ManageMetrics::new(registry.clone()).unwrap();

        metrics.record_job_started("portal", "build");
        metrics.record_job_finished("portal", "build", "succeeded", 3.5);
        metrics.record_conflict("portal");
        metrics.record_backup(true);
        metrics.record_backup(false);

        assert_eq!(counter_total(&registry, "manage_jobs_started_total"), 1.0);
        assert_eq!(counter_total(&registry, "manage_jobs_finished_total"), 1.0);
        assert_eq!(counter_total(&registry, "manage_conflicts_total"), 1.0);
        assert_eq!(counter_total(&registry, "manage_backups_total"), 2.0);

        let active = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "manage_jobs_active")
            .and_then(|family| family.get_metric().first().map(|m| m.get_gauge().get_value()))
            .unwrap();
        assert_eq!(active, 0.0);
    }

    #[tokio::test]
    async fn exporter_serves_registered_metrics() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(registry.clone()).unwrap();
        daemon.inc_start();

        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        assert!(content_type.starts_with("text/plain"), "{content_type}");
        let body = response.text().await.unwrap();
        assert!(body.contains("managed_starts_total 1"));
        server.shutdown().await.unwrap();
    }
}
