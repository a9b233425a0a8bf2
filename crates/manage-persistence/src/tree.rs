//! ---
//! manage_section: "03-persistence-logging"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Persistence abstractions and storage bindings."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Directory tree helpers used for artifact snapshots and promotion.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::Result;

/// Content digest of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDigest {
    /// Number of regular files hashed.
    pub files: u64,
    /// Sum of regular file sizes.
    pub bytes: u64,
    /// SHA-256 over every relative path and file body, in sorted path order.
    pub sha256: String,
}

/// Hash a directory tree. A missing directory digests as empty.
pub fn digest_tree(root: &Path) -> Result<TreeDigest> {
    let mut hasher = Sha256::new();
    let mut files = 0u64;
    let mut bytes = 0u64;
    if root.exists() {
        for entry in WalkDir::new(root).sort_by_file_name().min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            let mut file = File::open(entry.path())?;
            bytes += io::copy(&mut file, &mut hasher)?;
            files += 1;
        }
    }
    Ok(TreeDigest {
        files,
        bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Recursively copy `src` into `dst`, creating `dst`. Returns the number of files copied.
///
/// Symbolic links are recreated rather than followed on unix and skipped elsewhere.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0u64;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let destination = fs::read_link(link)?;
    std::os::unix::fs::symlink(destination, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, _target: &Path) -> Result<()> {
    warn!(path = %link.display(), "skipping symbolic link during copy");
    Ok(())
}

/// Swap a fully staged directory into place of `target`.
///
/// `staged` must share a parent with `target` so both renames stay on one
/// filesystem. The previous contents are removed once the swap has happened;
/// if the second rename fails the previous contents are moved back.
pub fn replace_dir(staged: &Path, target: &Path) -> Result<()> {
    let retired = sibling_path(target, "retired");
    let had_previous = target.exists();
    if had_previous {
        fs::rename(target, &retired)?;
    }
    if let Err(err) = fs::rename(staged, target) {
        if had_previous {
            if let Err(restore_err) = fs::rename(&retired, target) {
                warn!(target = %target.display(), error = %restore_err, "failed to restore previous directory");
            }
        }
        return Err(err.into());
    }
    if had_previous {
        if let Err(err) = fs::remove_dir_all(&retired) {
            warn!(path = %retired.display(), error = %err, "failed to remove retired directory");
        }
    }
    debug!(target = %target.display(), "directory swapped into place");
    Ok(())
}

/// Build a hidden sibling path such as `.output.staging-<uuid>`.
pub fn sibling_path(target: &Path, label: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_owned());
    let sibling = format!(".{name}.{label}-{}", uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(sibling),
        None => PathBuf::from(sibling),
    }
}

/// Write pretty JSON through a temporary sibling file and rename it into place.
pub fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = sibling_path(path, "tmp");
    let result = (|| -> Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("assets")).unwrap();
        fs::write(root.join("index.html"), "<html></html>").unwrap();
        fs::write(root.join("assets/app.js"), "console.log(1)").unwrap();
    }

    #[test]
    fn copy_preserves_digest() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);

        assert_eq!(copy_tree(&src, &dst).unwrap(), 2);
        let original = digest_tree(&src).unwrap();
        assert_eq!(original, digest_tree(&dst).unwrap());
        assert_eq!(original.files, 2);
    }

    #[test]
    fn digest_changes_with_content() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let before = digest_tree(dir.path()).unwrap();
        fs::write(dir.path().join("index.html"), "<html>v2</html>").unwrap();
        assert_ne!(before.sha256, digest_tree(dir.path()).unwrap().sha256);
    }

    #[test]
    fn replace_dir_swaps_contents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("output");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("old.txt"), "old").unwrap();

        let staged = sibling_path(&target, "staging");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("new.txt"), "new").unwrap();

        replace_dir(&staged, &target).unwrap();
        assert!(target.join("new.txt").exists());
        assert!(!target.join("old.txt").exists());
        assert!(!staged.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn atomic_json_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manage.json");
        write_json_atomic(&serde_json::json!({"portals": {}}), &path).unwrap();
        write_json_atomic(&serde_json::json!({"portals": {"a": 1}}), &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["portals"]["a"], 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
