//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Build and restore job records and their audit history."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use manage_persistence::{replay, EventLogWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::target::TargetKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Restore,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

/// What a job deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceRef {
    /// A repository revision; `None` means the head of the tracked branch.
    Revision { revision: Option<String> },
    /// A backup artifact and the revision it was taken at.
    Backup {
        backup_id: String,
        revision: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    CommandFailed { command: String, code: Option<i32> },
    Timeout { seconds: u64 },
    Cancelled,
    /// The daemon stopped before the job reached a terminal state.
    Interrupted,
    Repository { message: String },
    Storage { message: String },
    Panicked { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CommandFailed {
                command,
                code: Some(code),
            } => write!(f, "`{command}` exited with status {code}"),
            FailureReason::CommandFailed { command, code: None } => {
                write!(f, "`{command}` was terminated by a signal")
            }
            FailureReason::Timeout { seconds } => write!(f, "timed out after {seconds}s"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Interrupted => f.write_str("interrupted by daemon restart"),
            FailureReason::Repository { message } => write!(f, "repository error: {message}"),
            FailureReason::Storage { message } => write!(f, "storage error: {message}"),
            FailureReason::Panicked { message } => write!(f, "executor panicked: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Uuid,
    /// Acceptance order across all targets.
    pub sequence: u64,
    pub target: TargetKey,
    pub kind: JobKind,
    pub source: SourceRef,
    pub status: JobStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Snapshot taken immediately before this job touched the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    /// Revision deployed by the job, set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub log: String,
}

impl BuildJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, revision: Option<String>, log: String) {
        self.status = JobStatus::Succeeded;
        self.revision = revision;
        self.failure = None;
        self.log = log;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: FailureReason, log: String) {
        self.status = JobStatus::Failed;
        self.failure = Some(reason);
        self.log = log;
        self.finished_at = Some(Utc::now());
    }
}

/// Durable side of the job history.
trait Journal: Send {
    fn append(&mut self, job: &BuildJob) -> Result<()>;
    fn path(&self) -> &Path;
}

impl Journal for EventLogWriter<BuildJob> {
    fn append(&mut self, job: &BuildJob) -> Result<()> {
        EventLogWriter::append(self, job)?;
        Ok(())
    }

    fn path(&self) -> &Path {
        EventLogWriter::path(self)
    }
}

struct HistoryInner {
    journal: Box<dyn Journal>,
    jobs: IndexMap<Uuid, BuildJob>,
    last_sequence: u64,
}

/// Job audit trail: every state change is appended to a JSON-lines journal
/// and the latest record per job is kept in memory.
pub struct JobHistory {
    inner: Mutex<HistoryInner>,
}

impl fmt::Debug for JobHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("JobHistory")
            .field("path", &inner.journal.path())
            .field("jobs", &inner.jobs.len())
            .finish()
    }
}

impl JobHistory {
    /// Load the journal. Jobs that never reached a terminal state belonged to
    /// a previous process and are closed as interrupted.
    pub fn open(path: &Path) -> Result<Self> {
        let mut jobs: IndexMap<Uuid, BuildJob> = IndexMap::new();
        let replayed = replay::<BuildJob, _>(path, |entry| {
            jobs.insert(entry.record.id, entry.record);
            Ok(())
        })?;
        let mut writer = EventLogWriter::<BuildJob>::open(path)?;

        let mut interrupted = 0usize;
        for job in jobs.values_mut().filter(|job| !job.is_terminal()) {
            let log = std::mem::take(&mut job.log);
            job.mark_failed(FailureReason::Interrupted, log);
            writer.append(job)?;
            interrupted += 1;
        }
        if interrupted > 0 {
            warn!(interrupted, "closed jobs left running by a previous process");
        }

        let last_sequence = jobs.values().map(|job| job.sequence).max().unwrap_or(0);
        info!(path = %path.display(), replayed, jobs = jobs.len(), "job history loaded");
        Ok(Self {
            inner: Mutex::new(HistoryInner {
                journal: Box::new(writer),
                jobs,
                last_sequence,
            }),
        })
    }

    /// Register a new pending job with the next acceptance sequence.
    pub fn accept(
        &self,
        target: TargetKey,
        kind: JobKind,
        source: SourceRef,
        backup_id: Option<String>,
    ) -> Result<BuildJob> {
        let mut inner = self.inner.lock();
        let job = BuildJob {
            id: Uuid::new_v4(),
            sequence: inner.last_sequence + 1,
            target,
            kind,
            source,
            status: JobStatus::Pending,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            backup_id,
            revision: None,
            failure: None,
            log: String::new(),
        };
        inner.journal.append(&job)?;
        inner.last_sequence = job.sequence;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Persist a state change of an accepted job.
    ///
    /// The in-memory record is updated even when the journal append fails, so
    /// readers never see a finished job as still running.
    pub fn record(&self, job: &BuildJob) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.jobs.insert(job.id, job.clone());
        inner.journal.append(job)
    }

    pub fn get(&self, id: Uuid) -> Option<BuildJob> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    /// Jobs for one target, most recently accepted first.
    pub fn for_target(&self, key: &TargetKey) -> Vec<BuildJob> {
        self.inner
            .lock()
            .jobs
            .values()
            .rev()
            .filter(|job| &job.target == key)
            .cloned()
            .collect()
    }
}
