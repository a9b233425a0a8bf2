//! ---
//! manage_section: "05-networking-external-interfaces"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "HTTP surface over portal and REST management operations."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use manage_core::{
    Backup, BuildJob, FieldError, ManageError, Orchestrator, RepoState, Target, TargetKey,
    TargetKind, TargetStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared API state exposed to handlers.
pub struct ApiState {
    orchestrator: Orchestrator,
    version: String,
    start: Instant,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator, version: impl Into<String>) -> Self {
        Self {
            orchestrator,
            version: version.into(),
            start: Instant::now(),
        }
    }

    fn status(&self) -> Result<StatusResponse, ManageError> {
        Ok(StatusResponse {
            version: self.version.clone(),
            uptime_seconds: self.start.elapsed().as_secs(),
            portal_count: self.orchestrator.list(TargetKind::Portal)?.len(),
            rest_count: self.orchestrator.list(TargetKind::Rest)?.len(),
        })
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Routes shared by both target kinds, nested under `/portal` and `/rest`.
fn target_routes(kind: TargetKind) -> Router<Arc<ApiState>> {
    let router = Router::new()
        .route("/", get(list_targets).post(create_target))
        .route(
            "/:name",
            get(read_target)
                .put(update_target)
                .patch(update_target)
                .delete(delete_target),
        )
        .route(
            "/:name/build",
            get(inspect_target).post(request_build).delete(cancel_job),
        )
        .route("/:name/status", get(target_status))
        .route("/:name/jobs", get(target_jobs));

    let router = match kind {
        TargetKind::Portal => router
            .route("/:name/backups", get(list_backups).post(create_backup))
            .route("/:name/restore", post(restore_backup)),
        TargetKind::Rest => router,
    };
    router.layer(Extension(kind))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/jobs/:id", get(get_job))
        .nest("/portal", target_routes(TargetKind::Portal))
        .nest("/rest", target_routes(TargetKind::Rest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn the management API.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    portal_count: usize,
    rest_count: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
}

#[derive(Debug, Deserialize)]
struct CreateTargetRequest {
    name: String,
    record: Value,
}

#[derive(Debug, Deserialize)]
struct UpdateTargetRequest {
    record: Value,
}

#[derive(Debug, Default, Deserialize)]
struct BuildRequestBody {
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    backup: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    fields: Vec<FieldError>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
            fields: Vec::new(),
        }
    }
}

impl From<ManageError> for ApiError {
    fn from(err: ManageError) -> Self {
        let status = match &err {
            ManageError::NotFound { .. } => StatusCode::NOT_FOUND,
            ManageError::Conflict { .. } | ManageError::AlreadyExists { .. } => {
                StatusCode::CONFLICT
            }
            ManageError::Validation(_) => StatusCode::BAD_REQUEST,
            ManageError::RepositoryUnreachable { .. } => StatusCode::BAD_GATEWAY,
            ManageError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ManageError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(code = err.code(), error = %err, "request failed");
        }
        let message = err.to_string();
        let code = err.code();
        let fields = match err {
            ManageError::Validation(fields) => fields,
            _ => Vec::new(),
        };
        Self {
            status,
            code,
            message,
            fields,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            code: self.code,
            message: self.message,
            fields: self.fields,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn get_status(State(state): State<Arc<ApiState>>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(state.status()?))
}

async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BuildJob>> {
    Ok(Json(state.orchestrator.job(id)?))
}

async fn list_targets(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
) -> ApiResult<Json<Vec<Target>>> {
    Ok(Json(state.orchestrator.list(kind)?))
}

async fn create_target(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Json(request): Json<CreateTargetRequest>,
) -> ApiResult<(StatusCode, Json<Target>)> {
    let target = state
        .orchestrator
        .create(kind, &request.name, request.record)
        .await?;
    Ok((StatusCode::CREATED, Json(target)))
}

async fn read_target(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
) -> ApiResult<Json<Target>> {
    Ok(Json(state.orchestrator.read(&TargetKey::new(kind, name))?))
}

async fn update_target(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
    Json(request): Json<UpdateTargetRequest>,
) -> ApiResult<Json<Target>> {
    let key = TargetKey::new(kind, name);
    Ok(Json(state.orchestrator.update(&key, request.record).await?))
}

async fn delete_target(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete(&TargetKey::new(kind, name))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn inspect_target(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
) -> ApiResult<Json<RepoState>> {
    let key = TargetKey::new(kind, name);
    Ok(Json(state.orchestrator.inspect(&key).await?))
}

/// The body is optional; an empty one builds the head of the tracked branch.
async fn request_build(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<BuildJob>)> {
    let request: BuildRequestBody = if body.iter().all(u8::is_ascii_whitespace) {
        BuildRequestBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid build request: {err}")))?
    };
    let key = TargetKey::new(kind, name);
    let job = state.orchestrator.request_build(&key, request.revision).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn cancel_job(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
) -> ApiResult<Json<BuildJob>> {
    Ok(Json(state.orchestrator.cancel(&TargetKey::new(kind, name))?))
}

async fn target_status(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
) -> ApiResult<Json<TargetStatus>> {
    Ok(Json(state.orchestrator.status(&TargetKey::new(kind, name))?))
}

async fn target_jobs(
    State(state): State<Arc<ApiState>>,
    Extension(kind): Extension<TargetKind>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<BuildJob>>> {
    let key = TargetKey::new(kind, name);
    state.orchestrator.read(&key)?;
    Ok(Json(state.orchestrator.jobs(&key)))
}

async fn list_backups(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Backup>>> {
    Ok(Json(state.orchestrator.list_backups(&TargetKey::portal(name))?))
}

async fn create_backup(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<Backup>)> {
    let backup = state
        .orchestrator
        .create_backup(&TargetKey::portal(name))
        .await?;
    Ok((StatusCode::CREATED, Json(backup)))
}

async fn restore_backup(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<(StatusCode, Json<BuildJob>)> {
    let job = state
        .orchestrator
        .restore(&TargetKey::portal(name), &request.backup)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use manage_core::executor::promote;
    use manage_core::{
        BackupManager, BuildExecutor, BuildRequest, BuildResult, BuildSource, Components,
        JobHistory, JobStatus, JsonConfigStore, RecordValidator, RepositoryInspector,
    };
    use reqwest::Client;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::watch;

    struct StaticInspector;

    #[async_trait]
    impl RepositoryInspector for StaticInspector {
        async fn inspect(&self, target: &Target) -> manage_core::Result<RepoState> {
            if target.kind() == TargetKind::Rest {
                return Err(ManageError::RepositoryUnreachable {
                    target: target.key().to_string(),
                    reason: "connection refused".into(),
                });
            }
            let revision = target.revision.clone();
            Ok(RepoState {
                update_available: revision.as_deref() != Some("r9"),
                checkout_revision: revision.clone().unwrap_or_else(|| "r0".into()),
                revision,
                branch: Some("main".into()),
                dirty: false,
                remote_revision: Some("r9".into()),
                branches: vec!["main".into()],
                tags: Vec::new(),
                pending_updates: None,
                inspected_at: Utc::now(),
            })
        }
    }

    struct WritingExecutor;

    #[async_trait]
    impl BuildExecutor for WritingExecutor {
        async fn execute(&self, request: BuildRequest, _cancel: watch::Receiver<bool>) -> BuildResult {
            let output = request
                .target
                .spec
                .as_portal()
                .map(|portal| PathBuf::from(&portal.output));
            match request.source {
                BuildSource::Revision(revision) => {
                    let revision = revision.unwrap_or_else(|| "head".into());
                    if let Some(output) = output {
                        fs::write(output.join("index.html"), &revision).unwrap();
                    }
                    BuildResult::succeeded(Some(revision), "built")
                }
                BuildSource::Backup(backup) => {
                    promote(&backup.artifact_dir(), &output.unwrap()).unwrap();
                    BuildResult::succeeded(backup.revision.clone(), "restored")
                }
            }
        }
    }

    struct TestApi {
        dir: TempDir,
        server: ApiServer,
        client: Client,
    }

    impl TestApi {
        async fn start() -> Self {
            let dir = tempdir().unwrap();
            let components = Components {
                store: Arc::new(JsonConfigStore::open(dir.path().join("manage.json")).unwrap()),
                inspector: Arc::new(StaticInspector),
                executor: Arc::new(WritingExecutor),
                backups: BackupManager::new(dir.path().join("backups"), None),
                history: JobHistory::open(&dir.path().join("jobs.log")).unwrap(),
                validator: RecordValidator::new(false, "supervisorctl"),
            };
            let state = Arc::new(ApiState::new(Orchestrator::new(components, None), "test"));
            let server = spawn_api_server(state, "127.0.0.1:0".parse().unwrap()).unwrap();
            Self {
                dir,
                server,
                client: Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.server.addr(), path)
        }

        fn portal_record(&self, name: &str) -> Value {
            let repo = self.dir.path().join("repos").join(name);
            let output = self.dir.path().join("www").join(name);
            fs::create_dir_all(&repo).unwrap();
            fs::create_dir_all(&output).unwrap();
            fs::write(output.join("index.html"), "r1").unwrap();
            json!({
                "path": repo.display().to_string(),
                "output": output.display().to_string(),
            })
        }

        async fn wait_job(&self, id: &str) -> BuildJob {
            for _ in 0..200 {
                let job: BuildJob = self
                    .client
                    .get(self.url(&format!("/jobs/{id}")))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if job.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {id} did not finish");
        }
    }

    #[tokio::test]
    async fn portal_crud_round_trip() {
        let api = TestApi::start().await;
        let record = api.portal_record("site-a");

        let created = api
            .client
            .post(api.url("/portal"))
            .json(&json!({"name": "site-a", "record": record}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let duplicate = api
            .client
            .post(api.url("/portal"))
            .json(&json!({"name": "site-a", "record": record}))
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let updated: Value = api
            .client
            .put(api.url("/portal/site-a"))
            .json(&json!({"record": {"branch": "release"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(updated["spec"]["branch"], "release");

        let listed: Vec<Value> = api
            .client
            .get(api.url("/portal"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let deleted = api
            .client
            .delete(api.url("/portal/site-a"))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let missing = api
            .client
            .get(api.url("/portal/site-a"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        api.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_record_reports_fields() {
        let api = TestApi::start().await;
        let response = api
            .client
            .post(api.url("/portal"))
            .json(&json!({"name": "site-a", "record": {
                "path": "/definitely/not/here",
                "output": "/definitely/not/there",
            }}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "validation");
        let fields: Vec<&str> = body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|field| field["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"record.path"));
        assert!(fields.contains(&"record.output"));
        api.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn build_then_restore_over_http() {
        let api = TestApi::start().await;
        let record = api.portal_record("site-a");
        api.client
            .post(api.url("/portal"))
            .json(&json!({"name": "site-a", "record": record}))
            .send()
            .await
            .unwrap();

        let accepted = api
            .client
            .post(api.url("/portal/site-a/build"))
            .json(&json!({"revision": "r2"}))
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        let job: Value = accepted.json().await.unwrap();
        let finished = api.wait_job(job["id"].as_str().unwrap()).await;
        assert_eq!(finished.status, JobStatus::Succeeded);
        assert_eq!(finished.revision.as_deref(), Some("r2"));

        let backups: Vec<Value> = api
            .client
            .get(api.url("/portal/site-a/backups"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(backups.len(), 1);
        let backup_id = backups[0]["id"].as_str().unwrap().to_owned();

        let restore = api
            .client
            .post(api.url("/portal/site-a/restore"))
            .json(&json!({"backup": backup_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(restore.status(), StatusCode::ACCEPTED);
        let job: Value = restore.json().await.unwrap();
        api.wait_job(job["id"].as_str().unwrap()).await;

        let output = api.dir.path().join("www/site-a/index.html");
        assert_eq!(fs::read_to_string(output).unwrap(), "r1");

        let jobs: Vec<Value> = api
            .client
            .get(api.url("/portal/site-a/jobs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["kind"], "restore");

        api.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_build_body_targets_remote_head() {
        let api = TestApi::start().await;
        let record = api.portal_record("site-a");
        api.client
            .post(api.url("/portal"))
            .json(&json!({"name": "site-a", "record": record}))
            .send()
            .await
            .unwrap();

        let job: Value = api
            .client
            .post(api.url("/portal/site-a/build"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let finished = api.wait_job(job["id"].as_str().unwrap()).await;
        assert_eq!(finished.revision.as_deref(), Some("r9"));
        api.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rest_routes_map_core_errors() {
        let api = TestApi::start().await;
        let repo = api.dir.path().join("repos/api");
        fs::create_dir_all(&repo).unwrap();
        let created = api
            .client
            .post(api.url("/rest"))
            .json(&json!({"name": "api", "record": {"path": repo.display().to_string()}}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let inspect = api
            .client
            .get(api.url("/rest/api/build"))
            .send()
            .await
            .unwrap();
        assert_eq!(inspect.status(), StatusCode::BAD_GATEWAY);

        let backups = api
            .client
            .get(api.url("/rest/api/backups"))
            .send()
            .await
            .unwrap();
        assert_eq!(backups.status(), StatusCode::NOT_FOUND);

        let unknown = api
            .client
            .get(api.url(&format!("/jobs/{}", Uuid::new_v4())))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        let body: Value = unknown.json().await.unwrap();
        assert_eq!(body["code"], "not_found");

        let status: Value = api
            .client
            .get(api.url("/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["rest_count"], 1);

        api.server.shutdown().await.unwrap();
    }
}
