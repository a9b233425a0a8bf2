//! ---
//! manage_section: "15-testing-qa-runbook"
//! manage_subsection: "integration-tests"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "End-to-end build and restore against real git repositories."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use manage_common::AppConfig;
use manage_core::{
    BuildJob, FailureReason, JobStatus, Orchestrator, Phase, TargetKey, TargetKind,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Pipeline Test", "-c", "user.email=pipeline@test.invalid"])
        .args(["-c", "commit.gpgsign=false", "-c", "init.defaultBranch=main"])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .unwrap_or_else(|err| panic!("git {args:?} failed to start: {err}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

/// A bare origin, the deployed working copy, and a second clone used to
/// publish new commits.
struct Fixture {
    dir: TempDir,
    upstream: PathBuf,
    checkout: PathBuf,
    output: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let origin = dir.path().join("origin.git");
        let upstream = dir.path().join("upstream");
        let checkout = dir.path().join("site-a");
        let output = dir.path().join("www/site-a");
        fs::create_dir_all(&origin).unwrap();
        fs::create_dir_all(&output).unwrap();

        git(&origin, &["init", "--bare"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(dir.path(), &["clone", origin.to_str().unwrap(), "upstream"]);
        git(&upstream, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let fixture = Self {
            dir,
            upstream,
            checkout,
            output,
        };
        fixture.publish("v1");
        git(
            fixture.dir.path(),
            &["clone", "--branch", "main", origin.to_str().unwrap(), "site-a"],
        );
        fixture
    }

    /// Commit `content` as the site's index page and push it. Returns the sha.
    fn publish(&self, content: &str) -> String {
        fs::write(self.upstream.join("index.html"), content).unwrap();
        git(&self.upstream, &["add", "index.html"]);
        git(&self.upstream, &["commit", "-m", content]);
        git(&self.upstream, &["push", "origin", "main"]);
        git(&self.upstream, &["rev-parse", "HEAD"])
    }

    fn config(&self, timeout: u64) -> AppConfig {
        let root = self.dir.path().display();
        format!(
            r#"
            [store]
            path = "{root}/manage.json"

            [backups]
            directory = "{root}/backups"

            [history]
            path = "{root}/history/jobs.log"

            [build]
            timeout = {timeout}
            supervisorctl = "true"

            [validation]
            check_toolchains = false

            [logging]
            directory = "{root}/logs"

            [metrics]
            enabled = false

            [api]
            enabled = false
            "#
        )
        .parse()
        .unwrap()
    }

    async fn orchestrator(&self) -> (Orchestrator, TargetKey) {
        self.orchestrator_with_timeout(60).await
    }

    async fn orchestrator_with_timeout(&self, timeout: u64) -> (Orchestrator, TargetKey) {
        let orchestrator = Orchestrator::from_config(&self.config(timeout), None).unwrap();
        orchestrator
            .create(
                TargetKind::Portal,
                "site-a",
                json!({
                    "path": self.checkout.display().to_string(),
                    "output": self.output.display().to_string(),
                    "branch": "main",
                    "commands": ["mkdir -p dist && cp index.html dist/index.html"],
                }),
            )
            .await
            .unwrap();
        (orchestrator, TargetKey::portal("site-a"))
    }

    /// An orchestrator managing the working copy as a REST service.
    async fn rest_orchestrator(&self) -> (Orchestrator, TargetKey) {
        let orchestrator = Orchestrator::from_config(&self.config(60), None).unwrap();
        orchestrator
            .create(
                TargetKind::Rest,
                "api",
                json!({
                    "path": self.checkout.display().to_string(),
                    "branch": "main",
                    "services": {"api": {}},
                    "commands": ["cp index.html served.txt"],
                }),
            )
            .await
            .unwrap();
        (orchestrator, TargetKey::rest("api"))
    }

    fn served(&self) -> String {
        fs::read_to_string(self.output.join("index.html")).unwrap_or_default()
    }

    fn checkout_head(&self) -> String {
        git(&self.checkout, &["rev-parse", "HEAD"])
    }
}

async fn finish(orchestrator: &Orchestrator, job: &BuildJob) -> BuildJob {
    for _ in 0..500 {
        let current = orchestrator.job(job.id).unwrap();
        let idle = orchestrator.status(&job.target).unwrap().phase == Phase::Idle;
        if current.is_terminal() && idle {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not finish", job.id);
}

#[tokio::test]
async fn builds_remote_head_and_restores_previous_artifact() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.orchestrator().await;
    let first = git(&fixture.checkout, &["rev-parse", "HEAD"]);

    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Succeeded, "log:\n{}", job.log);
    assert_eq!(job.revision.as_deref(), Some(first.as_str()));
    assert_eq!(fixture.served(), "v1");

    let second = fixture.publish("v2");
    let state = orchestrator.inspect(&key).await.unwrap();
    assert!(state.update_available);
    assert_eq!(state.remote_revision.as_deref(), Some(second.as_str()));
    assert!(state.branches.contains(&"main".to_owned()));

    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Succeeded, "log:\n{}", job.log);
    assert_eq!(fixture.served(), "v2");
    assert_eq!(orchestrator.read(&key).unwrap().revision, Some(second.clone()));

    let backup_of_v1 = orchestrator
        .list_backups(&key)
        .unwrap()
        .into_iter()
        .find(|backup| backup.revision.as_deref() == Some(first.as_str()))
        .expect("snapshot taken before the second build");

    let job = orchestrator.restore(&key, &backup_of_v1.id).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Succeeded, "log:\n{}", job.log);
    assert_eq!(fixture.served(), "v1");
    assert_eq!(orchestrator.read(&key).unwrap().revision, Some(first));
}

#[tokio::test]
async fn failing_command_leaves_artifact_and_revision_alone() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.orchestrator().await;
    let job = orchestrator.request_build(&key, None).await.unwrap();
    finish(&orchestrator, &job).await;
    let deployed = orchestrator.read(&key).unwrap().revision;

    orchestrator
        .update(&key, json!({"commands": ["exit 3"]}))
        .await
        .unwrap();
    fixture.publish("v2");

    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.failure,
        Some(FailureReason::CommandFailed {
            command: "exit 3".into(),
            code: Some(3),
        })
    );
    assert_eq!(fixture.served(), "v1");
    assert_eq!(orchestrator.read(&key).unwrap().revision, deployed);
}

#[tokio::test]
async fn unknown_revision_fails_as_repository_error() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.orchestrator().await;

    let job = orchestrator
        .request_build(&key, Some("no-such-ref".into()))
        .await
        .unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::Repository { .. })));
    assert!(fixture.served().is_empty());
}

#[tokio::test]
async fn inspect_reports_deployed_revision_after_restore() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.orchestrator().await;
    let first = fixture.checkout_head();
    let job = orchestrator.request_build(&key, None).await.unwrap();
    finish(&orchestrator, &job).await;

    let second = fixture.publish("v2");
    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Succeeded, "log:\n{}", job.log);

    let backup_of_v1 = orchestrator
        .list_backups(&key)
        .unwrap()
        .into_iter()
        .find(|backup| backup.revision.as_deref() == Some(first.as_str()))
        .unwrap();
    let job = orchestrator.restore(&key, &backup_of_v1.id).await.unwrap();
    finish(&orchestrator, &job).await;
    assert_eq!(fixture.served(), "v1");

    let state = orchestrator.inspect(&key).await.unwrap();
    assert_eq!(state.revision.as_deref(), Some(first.as_str()));
    assert_eq!(state.checkout_revision, second);
    assert_eq!(state.remote_revision.as_deref(), Some(second.as_str()));
    assert!(state.update_available);
    assert_eq!(state.pending_updates, Some(1));
}

#[tokio::test]
async fn failed_rest_build_resets_working_copy() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.rest_orchestrator().await;
    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Succeeded, "log:\n{}", job.log);
    let deployed = orchestrator.read(&key).unwrap().revision;
    assert_eq!(deployed.as_deref(), Some(fixture.checkout_head().as_str()));

    orchestrator
        .update(&key, json!({"commands": ["exit 3"]}))
        .await
        .unwrap();
    fixture.publish("v2");

    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::CommandFailed { .. })));
    assert_eq!(orchestrator.read(&key).unwrap().revision, deployed);
    assert_eq!(Some(fixture.checkout_head()), deployed);
    assert_eq!(
        fs::read_to_string(fixture.checkout.join("index.html")).unwrap(),
        "v1"
    );
}

#[tokio::test]
async fn cancelling_a_running_command_keeps_the_deployed_artifact() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.orchestrator().await;
    let job = orchestrator.request_build(&key, None).await.unwrap();
    finish(&orchestrator, &job).await;
    let deployed = orchestrator.read(&key).unwrap().revision;

    orchestrator
        .update(&key, json!({"commands": ["sleep 30"]}))
        .await
        .unwrap();
    fixture.publish("v2");

    let started = Instant::now();
    let job = orchestrator.request_build(&key, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    orchestrator.cancel(&key).unwrap();
    let job = finish(&orchestrator, &job).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure, Some(FailureReason::Cancelled));
    assert_eq!(fixture.served(), "v1");
    assert_eq!(orchestrator.read(&key).unwrap().revision, deployed);
    assert_eq!(Some(fixture.checkout_head()), deployed);
}

#[tokio::test]
async fn slow_build_times_out_without_promoting() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let fixture = Fixture::new();
    let (orchestrator, key) = fixture.orchestrator_with_timeout(1).await;
    let before = fixture.checkout_head();
    orchestrator
        .update(&key, json!({"commands": ["sleep 30"]}))
        .await
        .unwrap();
    fixture.publish("v2");

    let started = Instant::now();
    let job = orchestrator.request_build(&key, None).await.unwrap();
    let job = finish(&orchestrator, &job).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure, Some(FailureReason::Timeout { seconds: 1 }));
    assert!(fixture.served().is_empty());
    assert_eq!(orchestrator.read(&key).unwrap().revision, None);
    assert_eq!(fixture.checkout_head(), before);
}
