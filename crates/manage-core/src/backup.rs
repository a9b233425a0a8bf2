//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Point-in-time snapshots of deployed portal artifacts."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Backup snapshots of portal output directories.
//!
//! Layout: `<root>/<portal>/<backup id>/{artifact/, manifest.json}`. A backup
//! is assembled in a hidden staging directory next to its final location and
//! renamed into place once the artifact copy and manifest are complete, so a
//! listed backup is always whole. Backups are never modified after creation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use manage_persistence::{
    copy_tree, digest_tree, read_manifest, sibling_path, write_manifest, TreeDigest,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ManageError, Result};
use crate::target::Target;
use crate::validation::normalize_path;

const ARTIFACT_DIR: &str = "artifact";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    /// Portal name the snapshot belongs to.
    pub target: String,
    /// Deployed revision at snapshot time.
    pub revision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub artifact: TreeDigest,
    #[serde(skip)]
    location: PathBuf,
}

impl Backup {
    /// Directory holding the snapshotted artifact.
    pub fn artifact_dir(&self) -> PathBuf {
        self.location.join(ARTIFACT_DIR)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupManifest {
    id: String,
    target: String,
    revision: Option<String>,
    created_at: DateTime<Utc>,
    artifact: TreeDigest,
}

fn new_backup_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

fn check_segment(what: &'static str, value: &str) -> Result<()> {
    let plain = !value.is_empty()
        && !value.starts_with('.')
        && !value.contains(['/', '\\'])
        && Path::new(value).file_name().is_some();
    if plain {
        Ok(())
    } else {
        Err(ManageError::not_found(what, value.to_owned()))
    }
}

/// Owns the backup root directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    retain_last: Option<usize>,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, retain_last: Option<usize>) -> Self {
        Self {
            root: root.into(),
            retain_last,
        }
    }

    fn target_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Snapshot the target's output directory together with its revision.
    ///
    /// On failure the staging directory is removed and no backup is listed.
    pub fn create(&self, target: &Target) -> Result<Backup> {
        let portal = target
            .spec
            .as_portal()
            .ok_or_else(|| ManageError::not_found("portal", target.name.clone()))?;
        check_segment("portal", &target.name)?;

        let created_at = Utc::now();
        let id = new_backup_id(created_at);
        let parent = self.target_dir(&target.name);
        fs::create_dir_all(&parent)
            .map_err(|err| ManageError::storage(format!("create {}", parent.display()), err))?;
        let location = parent.join(&id);
        let staging = sibling_path(&location, "staging");

        let staged = (|| -> Result<BackupManifest> {
            let output = normalize_path(&portal.output);
            let artifact = staging.join(ARTIFACT_DIR);
            if output.is_dir() {
                copy_tree(&output, &artifact)?;
            } else {
                warn!(target = %target.name, output = %output.display(), "output directory missing, snapshotting empty artifact");
                fs::create_dir_all(&artifact)?;
            }
            let manifest = BackupManifest {
                id: id.clone(),
                target: target.name.clone(),
                revision: target.revision.clone(),
                created_at,
                artifact: digest_tree(&artifact)?,
            };
            write_manifest(&manifest, &staging.join(MANIFEST_FILE))?;
            fs::rename(&staging, &location)?;
            Ok(manifest)
        })();

        let manifest = match staged {
            Ok(manifest) => manifest,
            Err(err) => {
                if staging.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&staging) {
                        warn!(path = %staging.display(), error = %cleanup, "failed to remove backup staging directory");
                    }
                }
                return Err(ManageError::storage(
                    format!("backup of portal/{}", target.name),
                    err,
                ));
            }
        };

        info!(
            target = %target.name,
            backup = %manifest.id,
            revision = manifest.revision.as_deref().unwrap_or("-"),
            files = manifest.artifact.files,
            "backup created"
        );

        if let Some(keep) = self.retain_last {
            self.prune(&target.name, keep)?;
        }

        Ok(Backup {
            id: manifest.id,
            target: manifest.target,
            revision: manifest.revision,
            created_at: manifest.created_at,
            artifact: manifest.artifact,
            location,
        })
    }

    /// Backups of a portal, most recent first. Entries with an unreadable or
    /// tampered manifest are skipped.
    pub fn list(&self, name: &str) -> Result<Vec<Backup>> {
        check_segment("portal", name)?;
        let dir = self.target_dir(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir)
            .map_err(|err| ManageError::storage(format!("list {}", dir.display()), err))?;
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.load(name, &entry.path()) {
                Ok(backup) => backups.push(backup),
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping unreadable backup");
                }
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(backups)
    }

    /// Look up one backup, verifying that it belongs to `name`.
    pub fn get(&self, name: &str, id: &str) -> Result<Backup> {
        check_segment("portal", name)?;
        check_segment("backup", id)?;
        let location = self.target_dir(name).join(id);
        if !location.is_dir() {
            return Err(ManageError::not_found("backup", id.to_owned()));
        }
        self.load(name, &location).map_err(|err| match err {
            ManageError::NotFound { .. } => err,
            other => {
                warn!(backup = %id, error = %other, "backup manifest rejected");
                ManageError::not_found("backup", id.to_owned())
            }
        })
    }

    fn load(&self, name: &str, location: &Path) -> Result<Backup> {
        let manifest: BackupManifest = read_manifest(&location.join(MANIFEST_FILE))?;
        let dir_name = location
            .file_name()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default();
        if manifest.target != name || manifest.id != dir_name {
            return Err(ManageError::not_found("backup", dir_name));
        }
        Ok(Backup {
            id: manifest.id,
            target: manifest.target,
            revision: manifest.revision,
            created_at: manifest.created_at,
            artifact: manifest.artifact,
            location: location.to_path_buf(),
        })
    }

    fn prune(&self, name: &str, keep: usize) -> Result<()> {
        let backups = self.list(name)?;
        for stale in backups.into_iter().skip(keep) {
            match fs::remove_dir_all(&stale.location) {
                Ok(()) => debug!(target = %name, backup = %stale.id, "pruned backup"),
                Err(err) => {
                    warn!(target = %name, backup = %stale.id, error = %err, "failed to prune backup")
                }
            }
        }
        Ok(())
    }
}
