//! ---
//! manage_section: "03-persistence-logging"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Persistence abstractions and storage bindings."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{PersistenceError, Result};

/// Current manifest envelope version.
pub const MANIFEST_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    body: Value,
}

/// Persist `body` inside a hashed envelope at `path`.
///
/// The hash covers the canonical JSON form of the body (object keys sorted),
/// so it survives a decode/re-encode through [`serde_json::Value`].
pub fn write_manifest<T: Serialize>(body: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let body = serde_json::to_value(body)?;
    let envelope = ManifestEnvelope {
        version: MANIFEST_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(&body)?,
        body,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Load and verify a manifest, returning the decoded body.
pub fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let envelope = load_envelope(path)?;
    if envelope.version > MANIFEST_VERSION {
        return Err(PersistenceError::UnsupportedVersion(envelope.version));
    }
    if compute_hash(&envelope.body)? != envelope.hash {
        return Err(PersistenceError::HashMismatch);
    }
    Ok(serde_json::from_value(envelope.body)?)
}

/// Verify the integrity of a manifest without decoding the body.
pub fn verify_manifest(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.body)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<ManifestEnvelope> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn compute_hash(body: &Value) -> Result<String> {
    let serialized = serde_json::to_vec(body)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Body {
        target: String,
        revision: Option<String>,
    }

    #[test]
    fn typed_body_survives_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let body = Body {
            target: "site-a".into(),
            revision: Some("r1".into()),
        };

        write_manifest(&body, &path).unwrap();
        assert!(verify_manifest(&path));
        let loaded: Body = read_manifest(&path).unwrap();
        assert_eq!(loaded, body);
    }

    #[test]
    fn tampered_body_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        write_manifest(&json!({"revision": "r1"}), &path).unwrap();

        let mut envelope: Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["body"]["revision"] = json!("r9");
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(!verify_manifest(&path));
        assert!(matches!(
            read_manifest::<Value>(&path),
            Err(PersistenceError::HashMismatch)
        ));
    }

    #[test]
    fn newer_envelope_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        write_manifest(&json!({"revision": "r1"}), &path).unwrap();

        let mut envelope: Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["version"] = json!(MANIFEST_VERSION + 1);
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(matches!(
            read_manifest::<Value>(&path),
            Err(PersistenceError::UnsupportedVersion(_))
        ));
    }
}
