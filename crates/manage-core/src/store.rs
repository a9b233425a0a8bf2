//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Persistent registry of portal and REST records."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use manage_persistence::write_json_atomic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{ManageError, Result};
use crate::target::{Target, TargetKey, TargetKind, TargetSpec};

/// Keyed persistence for targets with last-write-wins semantics.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &TargetKey) -> Result<Option<Target>>;

    /// All targets of one kind, in insertion order.
    fn list(&self, kind: TargetKind) -> Result<Vec<Target>>;

    /// Insert or replace a target.
    fn put(&self, target: Target) -> Result<()>;

    /// Remove a target, returning whether it existed.
    fn delete(&self, key: &TargetKey) -> Result<bool>;

    /// Record the deployed revision of an existing target.
    fn set_revision(&self, key: &TargetKey, revision: Option<String>) -> Result<()> {
        let mut target = self
            .get(key)?
            .ok_or_else(|| ManageError::not_found(key.kind.as_str(), key.name.clone()))?;
        target.revision = revision;
        self.put(target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    record: Map<String, Value>,
}

/// On-disk layout of `manage.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    portals: IndexMap<String, StoredRecord>,
    #[serde(default)]
    rest: IndexMap<String, StoredRecord>,
    /// Top-level keys owned by other tools, preserved on rewrite.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl StoreDocument {
    fn section(&self, kind: TargetKind) -> &IndexMap<String, StoredRecord> {
        match kind {
            TargetKind::Portal => &self.portals,
            TargetKind::Rest => &self.rest,
        }
    }

    fn section_mut(&mut self, kind: TargetKind) -> &mut IndexMap<String, StoredRecord> {
        match kind {
            TargetKind::Portal => &mut self.portals,
            TargetKind::Rest => &mut self.rest,
        }
    }
}

const REVISION_FIELD: &str = "revision";

fn decode(kind: TargetKind, name: &str, stored: &StoredRecord) -> Result<Target> {
    let mut record = stored.record.clone();
    let revision = match record.remove(REVISION_FIELD) {
        Some(Value::String(revision)) => Some(revision),
        _ => None,
    };
    let spec = TargetSpec::from_record(kind, Value::Object(record))
        .map_err(|err| ManageError::storage(format!("record {kind}/{name}"), err))?;
    Ok(Target {
        name: name.to_owned(),
        spec,
        revision,
    })
}

fn encode(target: &Target) -> Result<StoredRecord> {
    let mut record = match target.spec.to_record() {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(ManageError::Storage("record did not encode to an object".into())),
        Err(err) => return Err(ManageError::storage("encode record", err)),
    };
    if let Some(revision) = &target.revision {
        record.insert(REVISION_FIELD.to_owned(), Value::String(revision.clone()));
    }
    Ok(StoredRecord { record })
}

/// `manage.json` backed store.
///
/// The document is cached in memory. Writes clone the cache, persist the
/// clone through a temporary file and rename, and only then replace the cache.
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    document: Mutex<StoreDocument>,
}

impl JsonConfigStore {
    /// Open the store, treating a missing file as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|err| ManageError::storage(format!("read {}", path.display()), err))?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                StoreDocument::default()
            } else {
                serde_json::from_slice(&bytes).map_err(|err| {
                    ManageError::storage(format!("parse {}", path.display()), err)
                })?
            }
        } else {
            debug!(path = %path.display(), "record store missing, starting empty");
            StoreDocument::default()
        };
        info!(
            path = %path.display(),
            portals = document.portals.len(),
            rest = document.rest.len(),
            "record store loaded"
        );
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut StoreDocument) -> Result<bool>,
    {
        let mut guard = self.document.lock();
        let mut next = guard.clone();
        let changed = mutate(&mut next)?;
        if changed {
            write_json_atomic(&next, &self.path)?;
            *guard = next;
        }
        Ok(changed)
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, key: &TargetKey) -> Result<Option<Target>> {
        let document = self.document.lock();
        document
            .section(key.kind)
            .get(&key.name)
            .map(|stored| decode(key.kind, &key.name, stored))
            .transpose()
    }

    fn list(&self, kind: TargetKind) -> Result<Vec<Target>> {
        let document = self.document.lock();
        document
            .section(kind)
            .iter()
            .map(|(name, stored)| decode(kind, name, stored))
            .collect()
    }

    fn put(&self, target: Target) -> Result<()> {
        let stored = encode(&target)?;
        self.commit(|document| {
            document
                .section_mut(target.kind())
                .insert(target.name.clone(), stored);
            Ok(true)
        })?;
        Ok(())
    }

    fn delete(&self, key: &TargetKey) -> Result<bool> {
        self.commit(|document| Ok(document.section_mut(key.kind).shift_remove(&key.name).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{PortalSpec, RestSpec};
    use serde_json::json;
    use tempfile::tempdir;

    fn portal(name: &str) -> Target {
        let spec: PortalSpec =
            serde_json::from_value(json!({"path": "/srv/a", "output": "/var/www/a"})).unwrap();
        Target::new(name, TargetSpec::Portal(spec))
    }

    #[test]
    fn records_survive_reopen_with_revision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manage.json");
        let store = JsonConfigStore::open(&path).unwrap();
        store.put(portal("site-a")).unwrap();
        store
            .set_revision(&TargetKey::portal("site-a"), Some("r1".into()))
            .unwrap();

        let reopened = JsonConfigStore::open(&path).unwrap();
        let target = reopened.get(&TargetKey::portal("site-a")).unwrap().unwrap();
        assert_eq!(target.revision.as_deref(), Some("r1"));
        assert!(reopened.get(&TargetKey::rest("site-a")).unwrap().is_none());

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["portals"]["site-a"]["revision"], "r1");
        assert_eq!(raw["portals"]["site-a"]["dist"], "dist");
    }

    #[test]
    fn foreign_top_level_keys_are_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manage.json");
        fs::write(&path, r#"{"portals": {}, "rest": {}, "owner": "ops"}"#).unwrap();

        let store = JsonConfigStore::open(&path).unwrap();
        let spec: RestSpec = serde_json::from_value(json!({"path": "/srv/api"})).unwrap();
        store.put(Target::new("api", TargetSpec::Rest(spec))).unwrap();

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["owner"], "ops");
        assert!(raw["rest"]["api"].is_object());
    }

    #[test]
    fn delete_reports_presence_and_keeps_order() {
        let dir = tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("manage.json")).unwrap();
        for name in ["a", "b", "c"] {
            store.put(portal(name)).unwrap();
        }
        assert!(store.delete(&TargetKey::portal("b")).unwrap());
        assert!(!store.delete(&TargetKey::portal("b")).unwrap());

        let names: Vec<_> = store
            .list(TargetKind::Portal)
            .unwrap()
            .into_iter()
            .map(|target| target.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn set_revision_on_missing_target_is_not_found() {
        let dir = tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("manage.json")).unwrap();
        let err = store
            .set_revision(&TargetKey::portal("ghost"), Some("r1".into()))
            .unwrap_err();
        assert!(matches!(err, ManageError::NotFound { .. }));
    }
}
