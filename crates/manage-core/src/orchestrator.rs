//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Primary orchestration and lifecycle management."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Build and backup orchestration.
//!
//! Every mutating operation first claims its target in a keyed registry. The
//! claim is a conditional insert: a second request for a claimed target fails
//! with [`ManageError::Conflict`] instead of queueing, while other targets are
//! unaffected. A build or restore claim is handed to the background task that
//! runs the job and is released only after the terminal job state has been
//! recorded, so a target never has more than one non-terminal job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use manage_common::AppConfig;
use manage_metrics::ManageMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::{Backup, BackupManager};
use crate::error::{ManageError, Result};
use crate::executor::{
    promote, BuildExecutor, BuildOutcome, BuildRequest, BuildResult, BuildSource,
    CommandBuildExecutor,
};
use crate::git::Git;
use crate::inspector::{GitInspector, RepoState, RepositoryInspector};
use crate::jobs::{BuildJob, FailureReason, JobHistory, JobKind, JobStatus, SourceRef};
use crate::store::{ConfigStore, JsonConfigStore};
use crate::target::{Target, TargetKey, TargetKind};
use crate::validation::{merge_patch, normalize_path, validate_name, RecordValidator};

const EVENT_CAPACITY: usize = 256;
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Per-target lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    BackingUp,
    Building,
}

/// What currently holds a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Build,
    Restore,
    Backup,
    Edit,
}

impl Activity {
    fn describe(self) -> &'static str {
        match self {
            Activity::Build => "a build is in progress",
            Activity::Restore => "a restore is in progress",
            Activity::Backup => "a backup is in progress",
            Activity::Edit => "the record is being edited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetChange {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    PhaseChanged {
        target: TargetKey,
        phase: Phase,
        job: Option<Uuid>,
    },
    JobFinished {
        target: TargetKey,
        job: Uuid,
        status: JobStatus,
        revision: Option<String>,
    },
    BackupCreated {
        target: TargetKey,
        backup: String,
        revision: Option<String>,
    },
    TargetChanged {
        target: TargetKey,
        change: TargetChange,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub target: TargetKey,
    pub phase: Phase,
    pub activity: Option<Activity>,
    pub job: Option<Uuid>,
    pub revision: Option<String>,
}

struct Claim {
    activity: Activity,
    phase: Phase,
    job: Option<Uuid>,
    cancel: Option<watch::Sender<bool>>,
}

/// Pluggable parts of the orchestrator.
pub struct Components {
    pub store: Arc<dyn ConfigStore>,
    pub inspector: Arc<dyn RepositoryInspector>,
    pub executor: Arc<dyn BuildExecutor>,
    pub backups: BackupManager,
    pub history: JobHistory,
    pub validator: RecordValidator,
}

impl Components {
    /// Production wiring: `manage.json`, the git CLI, and shell builds.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let git = Git::from_config(&config.git);
        Ok(Self {
            store: Arc::new(JsonConfigStore::open(&config.store.path)?),
            inspector: Arc::new(GitInspector::new(git.clone())),
            executor: Arc::new(CommandBuildExecutor::new(&config.build, git)),
            backups: BackupManager::new(&config.backups.directory, config.backups.retain_last),
            history: JobHistory::open(&config.history.path)?,
            validator: RecordValidator::new(
                config.validation.check_toolchains,
                config.build.supervisorctl.clone(),
            ),
        })
    }
}

struct Shared {
    store: Arc<dyn ConfigStore>,
    inspector: Arc<dyn RepositoryInspector>,
    executor: Arc<dyn BuildExecutor>,
    backups: BackupManager,
    history: JobHistory,
    validator: RecordValidator,
    metrics: Option<ManageMetrics>,
    claims: Mutex<HashMap<TargetKey, Claim>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<OrchestratorEvent>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn emit(&self, event: OrchestratorEvent) {
        debug!(?event, "orchestrator event");
        let _ = self.events.send(event);
    }

    fn set_phase(&self, key: &TargetKey, phase: Phase) {
        let job = {
            let mut claims = self.claims.lock();
            match claims.get_mut(key) {
                Some(claim) => {
                    claim.phase = phase;
                    claim.job
                }
                None => return,
            }
        };
        self.emit(OrchestratorEvent::PhaseChanged {
            target: key.clone(),
            phase,
            job,
        });
    }

    fn release(&self, key: &TargetKey) {
        let released = self.claims.lock().remove(key);
        if let Some(claim) = released {
            if claim.phase != Phase::Idle {
                self.emit(OrchestratorEvent::PhaseChanged {
                    target: key.clone(),
                    phase: Phase::Idle,
                    job: claim.job,
                });
            }
        }
    }
}

/// Exclusive hold on one target, released on drop.
struct ClaimGuard {
    shared: Arc<Shared>,
    key: TargetKey,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.shared.release(&self.key);
    }
}

/// Sequences inspection, backup, and build for each target.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("claims", &self.shared.claims.lock().len())
            .field("history", &self.shared.history)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(components: Components, metrics: Option<ManageMetrics>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store: components.store,
                inspector: components.inspector,
                executor: components.executor,
                backups: components.backups,
                history: components.history,
                validator: components.validator,
                metrics,
                claims: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &AppConfig, metrics: Option<ManageMetrics>) -> Result<Self> {
        Ok(Self::new(Components::from_config(config)?, metrics))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    fn claim(&self, key: &TargetKey, activity: Activity) -> Result<ClaimGuard> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(ManageError::Cancelled);
        }
        let mut claims = self.shared.claims.lock();
        if let Some(existing) = claims.get(key) {
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_conflict(key.kind.as_str());
            }
            debug!(target = %key, held_by = ?existing.activity, requested = ?activity, "claim rejected");
            return Err(ManageError::Conflict {
                target: key.to_string(),
                reason: existing.activity.describe().to_owned(),
            });
        }
        claims.insert(
            key.clone(),
            Claim {
                activity,
                phase: Phase::Idle,
                job: None,
                cancel: None,
            },
        );
        drop(claims);
        Ok(ClaimGuard {
            shared: self.shared.clone(),
            key: key.clone(),
        })
    }

    fn load(&self, key: &TargetKey) -> Result<Target> {
        self.shared
            .store
            .get(key)?
            .ok_or_else(|| ManageError::not_found(key.kind.as_str(), key.name.clone()))
    }

    fn require_portal(key: &TargetKey) -> Result<()> {
        match key.kind {
            TargetKind::Portal => Ok(()),
            TargetKind::Rest => Err(ManageError::not_found("portal", key.name.clone())),
        }
    }

    async fn snapshot(&self, target: &Target) -> Result<Backup> {
        let backups = self.shared.backups.clone();
        let subject = target.clone();
        let created = tokio::task::spawn_blocking(move || backups.create(&subject))
            .await
            .map_err(|err| ManageError::storage("backup task", err))
            .and_then(|result| result);
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_backup(created.is_ok());
        }
        let backup = created?;
        self.shared.emit(OrchestratorEvent::BackupCreated {
            target: target.key(),
            backup: backup.id.clone(),
            revision: backup.revision.clone(),
        });
        Ok(backup)
    }

    /// Start a build of `revision`, or of the tracked branch head when `None`.
    ///
    /// The repository is inspected and (for portals) the deployed artifact
    /// is snapshotted before the job is accepted; failures in either step
    /// are returned without creating a job. The returned job runs in the
    /// background.
    pub async fn request_build(&self, key: &TargetKey, revision: Option<String>) -> Result<BuildJob> {
        let guard = self.claim(key, Activity::Build)?;
        let target = self.load(key)?;
        let state = self.shared.inspector.inspect(&target).await?;
        let revision = revision.or(state.remote_revision);

        let backup_id = match target.kind() {
            TargetKind::Portal => {
                self.shared.set_phase(key, Phase::BackingUp);
                Some(self.snapshot(&target).await?.id)
            }
            TargetKind::Rest => None,
        };

        let job = self.shared.history.accept(
            key.clone(),
            JobKind::Build,
            SourceRef::Revision {
                revision: revision.clone(),
            },
            backup_id,
        )?;
        info!(
            target = %key,
            job = %job.id,
            sequence = job.sequence,
            revision = revision.as_deref().unwrap_or("tracked head"),
            "build accepted"
        );
        Ok(self.launch(guard, target, job, BuildSource::Revision(revision)))
    }

    /// Redeploy a backup. The current artifact is snapshotted first so the
    /// restore itself can be undone.
    pub async fn restore(&self, key: &TargetKey, backup_id: &str) -> Result<BuildJob> {
        Self::require_portal(key)?;
        let guard = self.claim(key, Activity::Restore)?;
        let target = self.load(key)?;
        let backup = self.shared.backups.get(&key.name, backup_id)?;

        self.shared.set_phase(key, Phase::BackingUp);
        let safety = self.snapshot(&target).await?;

        let job = self.shared.history.accept(
            key.clone(),
            JobKind::Restore,
            SourceRef::Backup {
                backup_id: backup.id.clone(),
                revision: backup.revision.clone(),
            },
            Some(safety.id),
        )?;
        info!(
            target = %key,
            job = %job.id,
            backup = %backup.id,
            revision = backup.revision.as_deref().unwrap_or("unknown"),
            "restore accepted"
        );
        Ok(self.launch(guard, target, job, BuildSource::Backup(backup)))
    }

    fn launch(&self, guard: ClaimGuard, target: Target, job: BuildJob, source: BuildSource) -> BuildJob {
        let key = target.key();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(claim) = self.shared.claims.lock().get_mut(&key) {
            claim.job = Some(job.id);
            claim.cancel = Some(cancel_tx.clone());
        }
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            let _ = cancel_tx.send(true);
        }
        self.shared.set_phase(&key, Phase::Building);
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_job_started(key.kind.as_str(), job.kind.as_str());
        }

        let accepted = job.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(run_job(shared, guard, target, job, source, cancel_rx));
        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        accepted
    }

    /// Snapshot a portal's deployed artifact outside of a build.
    pub async fn create_backup(&self, key: &TargetKey) -> Result<Backup> {
        Self::require_portal(key)?;
        let _guard = self.claim(key, Activity::Backup)?;
        let target = self.load(key)?;
        self.shared.set_phase(key, Phase::BackingUp);
        self.snapshot(&target).await
    }

    /// Backups of a portal, most recent first.
    pub fn list_backups(&self, key: &TargetKey) -> Result<Vec<Backup>> {
        Self::require_portal(key)?;
        let target = self.load(key)?;
        self.shared.backups.list(&target.name)
    }

    /// Inspect a target's repository. Refused once its build is running.
    pub async fn inspect(&self, key: &TargetKey) -> Result<RepoState> {
        let target = self.load(key)?;
        if let Some(claim) = self.shared.claims.lock().get(key) {
            if claim.phase == Phase::Building {
                return Err(ManageError::Conflict {
                    target: key.to_string(),
                    reason: claim.activity.describe().to_owned(),
                });
            }
        }
        self.shared.inspector.inspect(&target).await
    }

    /// Ask the running job of a target to stop.
    pub fn cancel(&self, key: &TargetKey) -> Result<BuildJob> {
        let job_id = {
            let claims = self.shared.claims.lock();
            let claim = claims
                .get(key)
                .filter(|claim| claim.cancel.is_some())
                .ok_or_else(|| ManageError::not_found("job", format!("active job for {key}")))?;
            if let Some(cancel) = &claim.cancel {
                let _ = cancel.send(true);
            }
            claim.job
        };
        info!(target = %key, job = ?job_id, "cancellation requested");
        job_id
            .and_then(|id| self.shared.history.get(id))
            .ok_or_else(|| ManageError::not_found("job", format!("active job for {key}")))
    }

    pub fn status(&self, key: &TargetKey) -> Result<TargetStatus> {
        let target = self.load(key)?;
        let claims = self.shared.claims.lock();
        let claim = claims.get(key);
        Ok(TargetStatus {
            target: key.clone(),
            phase: claim.map(|claim| claim.phase).unwrap_or(Phase::Idle),
            activity: claim.map(|claim| claim.activity),
            job: claim.and_then(|claim| claim.job),
            revision: target.revision,
        })
    }

    pub fn job(&self, id: Uuid) -> Result<BuildJob> {
        self.shared
            .history
            .get(id)
            .ok_or_else(|| ManageError::not_found("job", id.to_string()))
    }

    /// Jobs of a target, most recently accepted first. History outlives the target.
    pub fn jobs(&self, key: &TargetKey) -> Vec<BuildJob> {
        self.shared.history.for_target(key)
    }

    pub async fn create(&self, kind: TargetKind, name: &str, record: Value) -> Result<Target> {
        validate_name(name)?;
        let key = TargetKey::new(kind, name);
        let _guard = self.claim(&key, Activity::Edit)?;
        if self.shared.store.get(&key)?.is_some() {
            return Err(ManageError::AlreadyExists {
                what: kind.as_str(),
                name: name.to_owned(),
            });
        }
        let spec = self.shared.validator.decode(kind, record).await?;
        let target = Target::new(name, spec);
        self.shared.store.put(target.clone())?;
        info!(target = %key, "target created");
        self.shared.emit(OrchestratorEvent::TargetChanged {
            target: key,
            change: TargetChange::Created,
        });
        Ok(target)
    }

    pub fn read(&self, key: &TargetKey) -> Result<Target> {
        self.load(key)
    }

    pub fn list(&self, kind: TargetKind) -> Result<Vec<Target>> {
        self.shared.store.list(kind)
    }

    /// Merge `patch` into the stored record; `null` members remove keys.
    /// The deployed revision is not editable.
    pub async fn update(&self, key: &TargetKey, patch: Value) -> Result<Target> {
        if !patch.is_object() {
            return Err(ManageError::invalid("record", "must be an object"));
        }
        let _guard = self.claim(key, Activity::Edit)?;
        let existing = self.load(key)?;
        let mut record = existing
            .spec
            .to_record()
            .map_err(|err| ManageError::storage(format!("encode {key}"), err))?;
        merge_patch(&mut record, patch);
        if let Some(map) = record.as_object_mut() {
            map.remove("revision");
        }
        let spec = self.shared.validator.decode(key.kind, record).await?;
        let target = Target {
            name: existing.name,
            spec,
            revision: existing.revision,
        };
        self.shared.store.put(target.clone())?;
        info!(target = %key, "target updated");
        self.shared.emit(OrchestratorEvent::TargetChanged {
            target: key.clone(),
            change: TargetChange::Updated,
        });
        Ok(target)
    }

    /// Remove a target record. Job history and backups are kept.
    pub fn delete(&self, key: &TargetKey) -> Result<()> {
        let _guard = self.claim(key, Activity::Edit)?;
        if !self.shared.store.delete(key)? {
            return Err(ManageError::not_found(key.kind.as_str(), key.name.clone()));
        }
        info!(target = %key, "target deleted");
        self.shared.emit(OrchestratorEvent::TargetChanged {
            target: key.clone(),
            change: TargetChange::Deleted,
        });
        Ok(())
    }

    /// Refuse new work, cancel running jobs, and wait until every claim is released.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let mut cancelled = 0usize;
        for cancel in self
            .shared
            .claims
            .lock()
            .values()
            .filter_map(|claim| claim.cancel.as_ref())
        {
            let _ = cancel.send(true);
            cancelled += 1;
        }
        info!(cancelled, "orchestrator shutting down");

        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock());
            let idle = handles.is_empty() && self.shared.claims.lock().is_empty();
            if idle {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(error = %err, "job task ended abnormally");
                }
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        info!("orchestrator stopped");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .unwrap_or_else(|| "unknown panic".to_owned()),
    }
}

/// Put the pre-build snapshot back after a promoted artifact could not be
/// recorded. Returns a description of what is deployed now.
async fn revert_unrecorded(
    shared: &Shared,
    key: &TargetKey,
    job: &BuildJob,
    output: Option<PathBuf>,
) -> String {
    let (Some(backup_id), Some(output)) = (job.backup_id.as_deref(), output) else {
        return "the new artifact is live but unrecorded".to_owned();
    };
    let backup = match shared.backups.get(&key.name, backup_id) {
        Ok(backup) => backup,
        Err(err) => return format!("backup {backup_id} unavailable ({err}); the new artifact is live"),
    };
    let source = backup.artifact_dir();
    match tokio::task::spawn_blocking(move || promote(&source, &output)).await {
        Ok(Ok(_)) => {
            warn!(target = %key, backup = %backup_id, "reverted to pre-build backup");
            format!("reverted to backup {backup_id}")
        }
        Ok(Err(err)) => format!("revert to backup {backup_id} failed ({err}); the new artifact is live"),
        Err(err) => format!("revert to backup {backup_id} failed ({err}); the new artifact is live"),
    }
}

async fn run_job(
    shared: Arc<Shared>,
    guard: ClaimGuard,
    target: Target,
    mut job: BuildJob,
    source: BuildSource,
    cancel: watch::Receiver<bool>,
) {
    let key = target.key();
    let started = Instant::now();
    job.mark_running();
    if let Err(err) = shared.history.record(&job) {
        error!(target = %key, job = %job.id, error = %err, "failed to record job start");
    }

    let output = target
        .spec
        .as_portal()
        .map(|portal| normalize_path(&portal.output));
    let request = BuildRequest {
        job_id: job.id,
        kind: job.kind,
        target,
        source,
    };
    // A panicking executor must still leave a terminal job behind before the
    // claim is released.
    let executor = shared.executor.clone();
    let result = match tokio::spawn(async move { executor.execute(request, cancel).await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let message = panic_message(err.into_panic());
            error!(target = %key, job = %job.id, %message, "executor panicked");
            BuildResult::failed(FailureReason::Panicked { message }, String::new())
        }
        Err(err) => BuildResult::failed(FailureReason::Cancelled, err.to_string()),
    };

    match result.outcome {
        BuildOutcome::Succeeded { revision } => {
            match shared.store.set_revision(&key, revision.clone()) {
                Ok(()) => job.mark_succeeded(revision, result.log),
                Err(err) => {
                    error!(target = %key, job = %job.id, error = %err, "failed to record deployed revision");
                    let message = revert_unrecorded(&shared, &key, &job, output).await;
                    job.mark_failed(
                        FailureReason::Storage {
                            message: format!("recording revision failed: {err}; {message}"),
                        },
                        result.log,
                    )
                }
            }
        }
        BuildOutcome::Failed(reason) => job.mark_failed(reason, result.log),
    }

    if let Err(err) = shared.history.record(&job) {
        error!(target = %key, job = %job.id, error = %err, "failed to record job outcome");
    }
    if let Some(metrics) = &shared.metrics {
        metrics.record_job_finished(
            key.kind.as_str(),
            job.kind.as_str(),
            job.status.as_str(),
            started.elapsed().as_secs_f64(),
        );
    }
    match &job.failure {
        None => info!(
            target = %key,
            job = %job.id,
            revision = job.revision.as_deref().unwrap_or("-"),
            "job succeeded"
        ),
        Some(reason) => warn!(target = %key, job = %job.id, %reason, "job failed"),
    }
    shared.emit(OrchestratorEvent::JobFinished {
        target: key,
        job: job.id,
        status: job.status,
        revision: job.revision.clone(),
    });
    drop(guard);
}
