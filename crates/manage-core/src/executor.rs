//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Build pipeline execution for portals and REST services."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Build execution.
//!
//! A build runs in two phases. The preparation phase (fetch, reset, build
//! commands, REST post-build steps) can be cancelled or time out at any
//! point; dropping it kills the running child process. The promotion phase
//! copies the built or restored artifact into a staging directory beside the
//! portal output and swaps it into place. Promotion starts only after a
//! successful preparation and always runs to completion, so the deployed
//! artifact is either the previous one or the new one.
//!
//! A revision build that does not succeed resets the working copy to the
//! commit it had before the build started.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use manage_common::BuildConfig;
use manage_persistence::{copy_tree, replace_dir, sibling_path};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::Backup;
use crate::git::Git;
use crate::jobs::{FailureReason, JobKind};
use crate::target::{PortalSpec, RestSpec, Target, TargetSpec};
use crate::validation::{normalize_path, shell_quote};

#[derive(Debug, Clone)]
pub enum BuildSource {
    /// Deploy a repository revision, or the tracked branch head when `None`.
    Revision(Option<String>),
    /// Redeploy a backup artifact.
    Backup(Backup),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub target: Target,
    pub source: BuildSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded { revision: Option<String> },
    Failed(FailureReason),
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub outcome: BuildOutcome,
    pub log: String,
}

impl BuildResult {
    pub fn succeeded(revision: Option<String>, log: impl Into<String>) -> Self {
        Self {
            outcome: BuildOutcome::Succeeded { revision },
            log: log.into(),
        }
    }

    pub fn failed(reason: FailureReason, log: impl Into<String>) -> Self {
        Self {
            outcome: BuildOutcome::Failed(reason),
            log: log.into(),
        }
    }
}

/// Runs one job to completion. Failures are reported in the result, never
/// as an error, so the orchestrator always reaches a terminal state.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, request: BuildRequest, cancel: watch::Receiver<bool>) -> BuildResult;
}

/// Resolves once the cancel flag is raised. A dropped sender never cancels.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Job log with a size cap. The tail is kept since failures are reported last.
#[derive(Debug)]
pub struct BuildLog {
    text: String,
    limit: usize,
    dropped: usize,
}

impl BuildLog {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    pub fn line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        self.compact(2 * self.limit);
    }

    pub fn output(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.text.push_str(&String::from_utf8_lossy(bytes));
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.compact(2 * self.limit);
    }

    fn compact(&mut self, threshold: usize) {
        if self.text.len() <= threshold {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.dropped += cut;
        self.text.drain(..cut);
    }

    pub fn finish(mut self) -> String {
        self.compact(self.limit);
        if self.dropped == 0 {
            self.text
        } else {
            format!("[{} bytes truncated]\n{}", self.dropped, self.text)
        }
    }
}

struct Prepared {
    /// Directory to promote into the portal output, if any.
    promote_from: Option<PathBuf>,
    revision: Option<String>,
}

/// Executor that drives git, the configured shell, pip, and supervisorctl.
#[derive(Debug, Clone)]
pub struct CommandBuildExecutor {
    git: Git,
    shell: String,
    supervisorctl: String,
    timeout: Duration,
    max_log_bytes: usize,
}

impl CommandBuildExecutor {
    pub fn new(config: &BuildConfig, git: Git) -> Self {
        Self {
            git,
            shell: config.shell.clone(),
            supervisorctl: config.supervisorctl.clone(),
            timeout: config.timeout,
            max_log_bytes: config.max_log_bytes,
        }
    }

    async fn prepare(
        &self,
        request: &BuildRequest,
        log: &mut BuildLog,
    ) -> Result<Prepared, FailureReason> {
        match (&request.source, &request.target.spec) {
            (BuildSource::Backup(backup), TargetSpec::Portal(_)) => {
                let artifact = backup.artifact_dir();
                if !artifact.is_dir() {
                    return Err(FailureReason::Storage {
                        message: format!("backup {} has no artifact", backup.id),
                    });
                }
                log.line(&format!(
                    "restoring backup {} (revision {})",
                    backup.id,
                    backup.revision.as_deref().unwrap_or("unknown")
                ));
                Ok(Prepared {
                    promote_from: Some(artifact),
                    revision: backup.revision.clone(),
                })
            }
            (BuildSource::Backup(_), TargetSpec::Rest(_)) => Err(FailureReason::Storage {
                message: "REST targets have no deployable artifact to restore".to_owned(),
            }),
            (BuildSource::Revision(revision), spec) => {
                let repo = normalize_path(spec.path());
                let resolved = self.checkout(&repo, spec, revision.as_deref(), log).await?;
                let promote_from = match spec {
                    TargetSpec::Portal(portal) => Some(self.build_portal(&repo, portal, log).await?),
                    TargetSpec::Rest(rest) => {
                        self.build_rest(&repo, rest, log).await?;
                        None
                    }
                };
                Ok(Prepared {
                    promote_from,
                    revision: Some(resolved),
                })
            }
        }
    }

    async fn checkout(
        &self,
        repo: &Path,
        spec: &TargetSpec,
        revision: Option<&str>,
        log: &mut BuildLog,
    ) -> Result<String, FailureReason> {
        let remote = self.git.remote().to_owned();
        self.git_step(repo, &["fetch", remote.as_str(), "--tags", "--prune"], log)
            .await?;

        let wanted = match revision {
            Some(revision) => revision.to_owned(),
            None => {
                let branch = match spec.branch() {
                    Some(branch) => branch.to_owned(),
                    None => self
                        .git
                        .line(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
                        .await
                        .map_err(repository_failure)?,
                };
                if branch == "HEAD" {
                    return Err(FailureReason::Repository {
                        message: "detached HEAD and no tracked branch configured".to_owned(),
                    });
                }
                format!("{remote}/{branch}")
            }
        };
        let commit = format!("{wanted}^{{commit}}");
        let sha = self
            .git
            .line(repo, &["rev-parse", "--verify", commit.as_str()])
            .await
            .map_err(repository_failure)?;
        log.line(&format!("resolved {wanted} to {sha}"));
        self.git_step(repo, &["reset", "--hard", sha.as_str()], log).await?;
        Ok(sha)
    }

    async fn git_step(
        &self,
        repo: &Path,
        args: &[&str],
        log: &mut BuildLog,
    ) -> Result<(), FailureReason> {
        log.line(&format!("$ git {}", args.join(" ")));
        match self.git.run_with_timeout(repo, args, self.timeout).await {
            Ok(output) => {
                log.output(output.stdout.as_bytes());
                log.output(output.stderr.as_bytes());
                Ok(())
            }
            Err(err) => {
                log.line(&err.to_string());
                Err(repository_failure(err))
            }
        }
    }

    async fn build_portal(
        &self,
        repo: &Path,
        spec: &PortalSpec,
        log: &mut BuildLog,
    ) -> Result<PathBuf, FailureReason> {
        for command in &spec.commands {
            let mut process = match spec.node.nvm.as_deref() {
                Some(alias) => {
                    let script = format!(
                        ". \"${{NVM_DIR:-$HOME/.nvm}}/nvm.sh\" && nvm use {} >/dev/null && {command}",
                        shell_quote(alias)
                    );
                    let mut process = Command::new("bash");
                    process.arg("-c").arg(script);
                    process
                }
                None => self.shell_command(command),
            };
            process.current_dir(repo);
            run_logged(process, command, log).await?;
        }

        let dist = repo.join(&spec.dist);
        if !dist.is_dir() {
            log.line(&format!("build output {} is missing", dist.display()));
            return Err(FailureReason::Storage {
                message: format!("build output {} is missing", spec.dist),
            });
        }
        Ok(dist)
    }

    async fn build_rest(
        &self,
        repo: &Path,
        spec: &RestSpec,
        log: &mut BuildLog,
    ) -> Result<(), FailureReason> {
        if let Some(requirements) = spec.python.requirements.as_deref() {
            let python = spec.python.which.as_deref().unwrap_or("python3");
            let requirements = normalize_path(requirements);
            let mut process = Command::new(normalize_python(python));
            process
                .args(["-m", "pip", "install", "-r"])
                .arg(&requirements)
                .current_dir(repo);
            let display = format!("{python} -m pip install -r {}", requirements.display());
            run_logged(process, &display, log).await?;
        }

        for command in &spec.commands {
            let mut process = self.shell_command(command);
            process.current_dir(repo);
            run_logged(process, command, log).await?;
        }

        for program in spec.supervisor_programs() {
            let mut process = Command::new(&self.supervisorctl);
            process.args(["restart", program.as_str()]);
            let display = format!("{} restart {program}", self.supervisorctl);
            run_logged(process, &display, log).await?;
        }
        Ok(())
    }

    /// Commit checked out before a revision build touches the working copy.
    async fn checkout_head(&self, target: &Target, log: &mut BuildLog) -> Option<(PathBuf, String)> {
        let repo = normalize_path(target.spec.path());
        match self.git.line(&repo, &["rev-parse", "--verify", "HEAD"]).await {
            Ok(head) => Some((repo, head)),
            Err(err) => {
                log.line(&format!("working copy has no current commit: {err}"));
                None
            }
        }
    }

    /// Reset the working copy to `head` after an unsuccessful build. For REST
    /// targets the working copy is the deployed code.
    async fn roll_back(&self, target: &Target, repo: &Path, head: &str, log: &mut BuildLog) {
        log.line(&format!("$ git reset --hard {head}"));
        match self.git.run(repo, &["reset", "--hard", head]).await {
            Ok(output) => {
                log.output(output.stdout.as_bytes());
                info!(target = %target.key(), revision = head, "working copy rolled back");
            }
            Err(err) => {
                log.line(&format!("rollback failed: {err}"));
                warn!(target = %target.key(), revision = head, error = %err, "failed to roll back working copy");
            }
        }
    }

    async fn promote_prepared(
        &self,
        request: &BuildRequest,
        promote_from: Option<PathBuf>,
        log: &mut BuildLog,
    ) -> Result<(), FailureReason> {
        let (Some(source), Some(portal)) = (promote_from, request.target.spec.as_portal()) else {
            return Ok(());
        };
        let output = normalize_path(&portal.output);
        log.line(&format!("promoting {} into {}", source.display(), output.display()));
        match tokio::task::spawn_blocking(move || promote(&source, &output)).await {
            Ok(Ok(files)) => {
                log.line(&format!("promoted {files} files"));
                Ok(())
            }
            Ok(Err(err)) => Err(FailureReason::Storage {
                message: err.to_string(),
            }),
            Err(join) => Err(FailureReason::Storage {
                message: join.to_string(),
            }),
        }
    }

    fn shell_command(&self, command: &str) -> Command {
        let mut process = Command::new(&self.shell);
        process.arg("-c").arg(command);
        process
    }
}

/// Bare interpreter names are resolved through `PATH`; anything with a
/// separator is treated as a path.
fn normalize_python(python: &str) -> PathBuf {
    if python.contains('/') || python.starts_with('~') {
        normalize_path(python)
    } else {
        PathBuf::from(python)
    }
}

fn repository_failure(err: crate::git::GitError) -> FailureReason {
    FailureReason::Repository {
        message: err.to_string(),
    }
}

async fn run_logged(
    mut process: Command,
    display: &str,
    log: &mut BuildLog,
) -> Result<(), FailureReason> {
    log.line(&format!("$ {display}"));
    let output = process
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| {
            log.line(&format!("failed to start: {err}"));
            FailureReason::CommandFailed {
                command: display.to_owned(),
                code: None,
            }
        })?;
    log.output(&output.stdout);
    log.output(&output.stderr);
    if output.status.success() {
        Ok(())
    } else {
        Err(FailureReason::CommandFailed {
            command: display.to_owned(),
            code: output.status.code(),
        })
    }
}

/// Copy `source` next to `output` and swap it into place.
pub fn promote(source: &Path, output: &Path) -> manage_persistence::Result<u64> {
    let staging = sibling_path(output, "staging");
    let result = copy_tree(source, &staging).and_then(|files| {
        replace_dir(&staging, output)?;
        Ok(files)
    });
    if result.is_err() && staging.exists() {
        if let Err(err) = fs::remove_dir_all(&staging) {
            warn!(path = %staging.display(), error = %err, "failed to remove promotion staging directory");
        }
    }
    result
}

#[async_trait]
impl BuildExecutor for CommandBuildExecutor {
    async fn execute(
        &self,
        request: BuildRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> BuildResult {
        let started = Instant::now();
        let mut log = BuildLog::new(self.max_log_bytes);
        log.line(&format!(
            "{} {} ({})",
            request.kind.as_str(),
            request.target.key(),
            request.job_id
        ));

        let previous = match request.source {
            BuildSource::Revision(_) => self.checkout_head(&request.target, &mut log).await,
            BuildSource::Backup(_) => None,
        };

        let prepared = {
            let work = self.prepare(&request, &mut log);
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => Err(FailureReason::Cancelled),
                _ = tokio::time::sleep(self.timeout) => Err(FailureReason::Timeout {
                    seconds: self.timeout.as_secs(),
                }),
                result = work => result,
            }
        };

        let prepared = match prepared {
            Ok(prepared) if *cancel.borrow() => {
                drop(prepared);
                Err(FailureReason::Cancelled)
            }
            other => other,
        };

        let outcome = match prepared {
            Err(reason) => Err(reason),
            Ok(prepared) => self
                .promote_prepared(&request, prepared.promote_from, &mut log)
                .await
                .map(|()| prepared.revision),
        };

        let result = match outcome {
            Ok(revision) => BuildResult::succeeded(revision, log.finish()),
            Err(reason) => {
                log.line(&format!("failed: {reason}"));
                if let Some((repo, head)) = &previous {
                    self.roll_back(&request.target, repo, head, &mut log).await;
                }
                BuildResult::failed(reason, log.finish())
            }
        };

        info!(
            target = %request.target.key(),
            job = %request.job_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            succeeded = matches!(result.outcome, BuildOutcome::Succeeded { .. }),
            "execution finished"
        );
        result
    }
}
