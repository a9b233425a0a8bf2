//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Git command runner shared by inspection and builds."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use manage_common::GitConfig;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("git {command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs git subcommands inside a working copy, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct Git {
    binary: String,
    remote: String,
    timeout: Duration,
}

impl Git {
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            remote: config.remote.clone(),
            timeout: config.timeout,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub async fn run(&self, repo: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        self.run_with_timeout(repo, args, self.timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        repo: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, GitError> {
        let command = args.join(" ");
        debug!(repo = %repo.display(), %command, "running git");
        let child = Command::new(&self.binary)
            .args(args)
            .current_dir(repo)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|source| GitError::Spawn {
                binary: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(GitError::Timeout {
                    command,
                    seconds: timeout.as_secs(),
                })
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(GitOutput { stdout, stderr })
        } else {
            Err(GitError::Failed {
                command,
                code: output.status.code(),
                stderr: stderr.trim().to_owned(),
            })
        }
    }

    /// First line of stdout, trimmed.
    pub async fn line(&self, repo: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(repo, args).await?;
        Ok(output.stdout.lines().next().unwrap_or_default().trim().to_owned())
    }
}
