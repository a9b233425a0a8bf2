//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Primary orchestration and lifecycle management."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Build-and-backup orchestration for portal and REST deployments: the
//! record store, repository inspection, build execution, backup snapshots,
//! and the per-target state machine that sequences them.

pub mod backup;
pub mod error;
pub mod executor;
pub mod git;
pub mod inspector;
pub mod jobs;
pub mod orchestrator;
pub mod store;
pub mod target;
pub mod validation;

pub use backup::{Backup, BackupManager};
pub use error::{FieldError, ManageError, Result};
pub use executor::{
    BuildExecutor, BuildOutcome, BuildRequest, BuildResult, BuildSource, CommandBuildExecutor,
};
pub use git::{Git, GitError};
pub use inspector::{GitInspector, RepoState, RepositoryInspector};
pub use jobs::{BuildJob, FailureReason, JobHistory, JobKind, JobStatus, SourceRef};
pub use orchestrator::{
    Activity, Components, Orchestrator, OrchestratorEvent, Phase, TargetChange, TargetStatus,
};
pub use store::{ConfigStore, JsonConfigStore};
pub use target::{
    NodeSettings, PortalSpec, PythonSettings, RestSpec, ServiceSettings, Target, TargetKey,
    TargetKind, TargetSpec,
};
pub use validation::RecordValidator;
