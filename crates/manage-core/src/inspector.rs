//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Read-only repository inspection."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ManageError, Result};
use crate::git::{Git, GitError};
use crate::target::Target;
use crate::validation::normalize_path;

/// Point-in-time view of a target's repository. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    /// Revision recorded by the last successful build or restore; `None`
    /// until the target has been deployed once.
    pub revision: Option<String>,
    /// Commit the working copy currently has checked out. Diverges from
    /// `revision` after a restore.
    pub checkout_revision: String,
    /// Checked-out branch, `None` when detached.
    pub branch: Option<String>,
    pub dirty: bool,
    /// Head of the tracked branch on the remote.
    pub remote_revision: Option<String>,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
    /// Commits between the deployed revision and the remote head, when the
    /// remote head is already known locally.
    pub pending_updates: Option<u64>,
    pub update_available: bool,
    pub inspected_at: DateTime<Utc>,
}

#[async_trait]
pub trait RepositoryInspector: Send + Sync {
    /// Report the repository state without mutating the working copy.
    async fn inspect(&self, target: &Target) -> Result<RepoState>;
}

/// Inspector backed by the `git` CLI. Remote metadata comes from `ls-remote`,
/// so nothing is fetched into the working copy.
#[derive(Debug, Clone)]
pub struct GitInspector {
    git: Git,
}

impl GitInspector {
    pub fn new(git: Git) -> Self {
        Self { git }
    }
}

#[derive(Debug, Default)]
struct RemoteRefs {
    heads: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
}

fn parse_ls_remote(stdout: &str) -> RemoteRefs {
    let mut refs = RemoteRefs::default();
    for line in stdout.lines() {
        let Some((sha, name)) = line.split_once('\t') else {
            continue;
        };
        if let Some(branch) = name.strip_prefix("refs/heads/") {
            refs.heads.insert(branch.to_owned(), sha.to_owned());
        } else if let Some(tag) = name.strip_prefix("refs/tags/") {
            match tag.strip_suffix("^{}") {
                // Peeled entries point at the tagged commit and win over the tag object.
                Some(peeled) => {
                    refs.tags.insert(peeled.to_owned(), sha.to_owned());
                }
                None => {
                    refs.tags.entry(tag.to_owned()).or_insert_with(|| sha.to_owned());
                }
            }
        }
    }
    refs
}

#[async_trait]
impl RepositoryInspector for GitInspector {
    async fn inspect(&self, target: &Target) -> Result<RepoState> {
        let key = target.key();
        let repo = normalize_path(target.spec.path());
        if !repo.is_dir() {
            return Err(ManageError::not_found("repository", repo.display().to_string()));
        }

        let checkout_revision = self
            .git
            .line(&repo, &["rev-parse", "HEAD"])
            .await
            .map_err(|err| {
                debug!(target = %key, error = %err, "rev-parse failed");
                ManageError::not_found("repository", repo.display().to_string())
            })?;
        let head = self
            .git
            .line(&repo, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map_err(|err| ManageError::storage(format!("inspect {key}"), err))?;
        let branch = (head != "HEAD").then_some(head);
        let dirty = !self
            .git
            .run(&repo, &["status", "--porcelain"])
            .await
            .map_err(|err| ManageError::storage(format!("inspect {key}"), err))?
            .stdout
            .trim()
            .is_empty();

        let listing = self
            .git
            .run(&repo, &["ls-remote", "--heads", "--tags", self.git.remote()])
            .await
            .map_err(|err| ManageError::RepositoryUnreachable {
                target: key.to_string(),
                reason: match err {
                    GitError::Failed { stderr, .. } if !stderr.is_empty() => stderr,
                    other => other.to_string(),
                },
            })?;
        let refs = parse_ls_remote(&listing.stdout);

        let tracked = target
            .spec
            .branch()
            .map(str::to_owned)
            .or_else(|| branch.clone());
        let remote_revision = tracked.and_then(|name| refs.heads.get(&name).cloned());
        let revision = target.revision.clone();
        let deployed = revision.as_deref().unwrap_or(checkout_revision.as_str());
        let update_available = remote_revision
            .as_deref()
            .is_some_and(|remote| remote != deployed);

        let pending_updates = match (&remote_revision, update_available) {
            (Some(remote), true) => {
                let range = format!("{deployed}..{remote}");
                self.git
                    .line(&repo, &["rev-list", "--count", range.as_str()])
                    .await
                    .ok()
                    .and_then(|count| count.parse().ok())
            }
            _ => Some(0),
        };

        info!(
            target = %key,
            revision = deployed,
            checkout = %checkout_revision,
            remote = remote_revision.as_deref().unwrap_or("-"),
            update_available,
            "repository inspected"
        );

        Ok(RepoState {
            revision,
            checkout_revision,
            branch,
            dirty,
            remote_revision,
            branches: refs.heads.into_keys().collect(),
            tags: refs.tags.into_keys().collect(),
            pending_updates,
            update_available,
            inspected_at: Utc::now(),
        })
    }
}
