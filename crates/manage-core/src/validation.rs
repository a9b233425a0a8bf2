//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Record validation and merge semantics for target CRUD."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::path::{Component, Path, PathBuf};

use path_absolutize::Absolutize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{FieldError, ManageError, Result};
use crate::target::{PortalSpec, RestSpec, TargetKind, TargetSpec};

/// Expand a leading `~` and make the path absolute against the working directory.
pub fn normalize_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    let expanded = match trimmed.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
            None => PathBuf::from(trimmed),
        },
        _ => PathBuf::from(trimmed),
    };
    match expanded.absolutize() {
        Ok(path) => path.into_owned(),
        Err(_) => expanded,
    }
}

/// Apply an RFC 7396 merge patch: objects merge recursively, `null` removes.
pub fn merge_patch(base: &mut Value, patch: Value) {
    match patch {
        Value::Object(entries) => {
            if !base.is_object() {
                *base = Value::Object(Default::default());
            }
            if let Value::Object(target) = base {
                for (key, value) in entries {
                    if value.is_null() {
                        target.remove(&key);
                    } else {
                        merge_patch(target.entry(key).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *base = other,
    }
}

/// Check a target name before it becomes a store key and a backup directory.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name != name.trim() {
        Some("must not have surrounding whitespace")
    } else if name.starts_with('.') {
        Some("must not start with '.'")
    } else if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        Some("must not contain path separators or control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ManageError::invalid("name", reason)),
        None => Ok(()),
    }
}

fn trim_optional(value: &mut Option<String>) {
    let trimmed = value
        .as_deref()
        .map(str::trim)
        .filter(|inner| !inner.is_empty())
        .map(str::to_owned);
    *value = trimmed;
}

fn check_dir(errors: &mut Vec<FieldError>, field: &str, raw: &mut String) {
    *raw = raw.trim().to_owned();
    if raw.is_empty() || !normalize_path(raw).is_dir() {
        errors.push(FieldError::new(field, "not a valid directory"));
    }
}

fn check_file(errors: &mut Vec<FieldError>, field: &str, raw: &mut Option<String>) {
    trim_optional(raw);
    if let Some(path) = raw {
        if !normalize_path(path).is_file() {
            errors.push(FieldError::new(field, "not found"));
        }
    }
}

fn check_commands(errors: &mut Vec<FieldError>, commands: &mut Vec<String>) {
    for command in commands.iter_mut() {
        *command = command.trim().to_owned();
    }
    if let Some(index) = commands.iter().position(String::is_empty) {
        errors.push(FieldError::new(
            format!("record.commands.{index}"),
            "must not be empty",
        ));
    }
}

fn check_relative(errors: &mut Vec<FieldError>, field: &str, raw: &mut String) {
    *raw = raw.trim().to_owned();
    let path = Path::new(raw.as_str());
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if raw.is_empty() || escapes {
        errors.push(FieldError::new(
            field,
            "must be a relative path inside the repository",
        ));
    }
}

/// Validates and normalises records before they reach the store.
///
/// Filesystem checks always run. Toolchain checks (nvm aliases, supervisor
/// programs) shell out and only run when enabled.
#[derive(Debug, Clone)]
pub struct RecordValidator {
    check_toolchains: bool,
    supervisorctl: String,
}

impl RecordValidator {
    pub fn new(check_toolchains: bool, supervisorctl: impl Into<String>) -> Self {
        Self {
            check_toolchains,
            supervisorctl: supervisorctl.into(),
        }
    }

    /// Decode a raw record body and validate it.
    pub async fn decode(&self, kind: TargetKind, record: Value) -> Result<TargetSpec> {
        if !record.is_object() {
            return Err(ManageError::invalid("record", "must be an object"));
        }
        let spec = TargetSpec::from_record(kind, record)
            .map_err(|err| ManageError::invalid("record", err.to_string()))?;
        self.validate(spec).await
    }

    pub async fn validate(&self, spec: TargetSpec) -> Result<TargetSpec> {
        match spec {
            TargetSpec::Portal(portal) => self.validate_portal(portal).await.map(TargetSpec::Portal),
            TargetSpec::Rest(rest) => self.validate_rest(rest).await.map(TargetSpec::Rest),
        }
    }

    async fn validate_portal(&self, mut spec: PortalSpec) -> Result<PortalSpec> {
        let mut errors = Vec::new();
        check_dir(&mut errors, "record.path", &mut spec.path);
        check_dir(&mut errors, "record.output", &mut spec.output);
        check_relative(&mut errors, "record.dist", &mut spec.dist);
        trim_optional(&mut spec.branch);
        trim_optional(&mut spec.node.nvm);
        check_commands(&mut errors, &mut spec.commands);

        if let (true, Some(alias)) = (self.check_toolchains, spec.node.nvm.as_deref()) {
            if let Err(reason) = nvm_alias_exists(alias).await {
                errors.push(FieldError::new("record.node.nvm", reason));
            }
        }

        finish(spec, errors)
    }

    async fn validate_rest(&self, mut spec: RestSpec) -> Result<RestSpec> {
        let mut errors = Vec::new();
        check_dir(&mut errors, "record.path", &mut spec.path);
        trim_optional(&mut spec.branch);
        check_file(&mut errors, "record.python.which", &mut spec.python.which);
        check_file(
            &mut errors,
            "record.python.requirements",
            &mut spec.python.requirements,
        );
        check_commands(&mut errors, &mut spec.commands);
        for service in spec.services.values_mut() {
            trim_optional(&mut service.supervisor);
        }

        if self.check_toolchains && !spec.services.is_empty() {
            match self.supervisor_programs().await {
                Ok(available) => {
                    for (name, service) in &spec.services {
                        let (field, program) = match &service.supervisor {
                            Some(program) => (format!("record.services.{name}.supervisor"), program),
                            None => (format!("record.services.{name}"), name),
                        };
                        if !available.iter().any(|candidate| candidate == program) {
                            errors.push(FieldError::new(field, "not a valid supervisor program"));
                        }
                    }
                }
                Err(reason) => errors.push(FieldError::new("record.services", reason)),
            }
        }

        finish(spec, errors)
    }

    async fn supervisor_programs(&self) -> std::result::Result<Vec<String>, String> {
        let output = Command::new(&self.supervisorctl)
            .arg("avail")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| format!("failed to run {}: {err}", self.supervisorctl))?;
        if !output.status.success() {
            return Err(format!(
                "{} avail exited with {}",
                self.supervisorctl, output.status
            ));
        }
        let programs: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_owned)
            .collect();
        debug!(count = programs.len(), "supervisor programs listed");
        Ok(programs)
    }
}

fn finish<T>(spec: T, errors: Vec<FieldError>) -> Result<T> {
    if errors.is_empty() {
        Ok(spec)
    } else {
        Err(ManageError::Validation(errors))
    }
}

/// nvm is a shell function, so the lookup runs inside an interactive bash.
async fn nvm_alias_exists(alias: &str) -> std::result::Result<(), String> {
    let script = format!("nvm alias {}", shell_quote(alias));
    let output = Command::new("bash")
        .args(["-i", "-c", &script])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| format!("failed to run nvm: {err}"))?;
    if !output.status.success() {
        warn!(alias, status = %output.status, "nvm alias lookup failed");
        return Err(format!("nvm exited with {}", output.status));
    }
    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        return Err("invalid alias".to_owned());
    }
    Ok(())
}

/// Single-quote a value for `sh -c`.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn validator() -> RecordValidator {
        RecordValidator::new(false, "supervisorctl")
    }

    #[test]
    fn merge_patch_removes_nulls_and_merges_objects() {
        let mut base = json!({
            "path": "/srv/api",
            "services": {"auth": {}, "mail": {"supervisor": "mail-worker"}}
        });
        merge_patch(
            &mut base,
            json!({"services": {"auth": null, "jobs": {}}, "branch": "main"}),
        );
        assert_eq!(
            base,
            json!({
                "path": "/srv/api",
                "branch": "main",
                "services": {"mail": {"supervisor": "mail-worker"}, "jobs": {}}
            })
        );
    }

    #[test]
    fn names_must_be_plain_segments() {
        assert!(validate_name("site-a").is_ok());
        for bad in ["", " site", "../etc", ".hidden", "a/b"] {
            assert!(validate_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        if home.is_empty() {
            return;
        }
        assert_eq!(normalize_path("~/site"), Path::new(&home).join("site"));
        assert!(normalize_path("relative/dir").is_absolute());
    }

    #[tokio::test]
    async fn portal_paths_are_checked_and_trimmed() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let err = validator()
            .decode(
                TargetKind::Portal,
                json!({
                    "path": format!(" {} ", repo.display()),
                    "output": dir.path().join("missing").display().to_string(),
                    "dist": "../escape",
                }),
            )
            .await
            .unwrap_err();
        let ManageError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        let names: Vec<_> = fields.iter().map(|field| field.field.as_str()).collect();
        assert_eq!(names, vec!["record.output", "record.dist"]);

        let spec = validator()
            .decode(
                TargetKind::Portal,
                json!({
                    "path": format!(" {} ", repo.display()),
                    "output": dir.path().display().to_string(),
                    "node": {"nvm": "   "},
                }),
            )
            .await
            .unwrap();
        let portal = spec.as_portal().unwrap();
        assert_eq!(portal.path, repo.display().to_string());
        assert!(portal.node.nvm.is_none());
    }

    #[tokio::test]
    async fn rest_python_files_must_exist() {
        let dir = tempdir().unwrap();
        let requirements = dir.path().join("requirements.txt");
        std::fs::write(&requirements, "flask\n").unwrap();

        let err = validator()
            .decode(
                TargetKind::Rest,
                json!({
                    "path": dir.path().display().to_string(),
                    "python": {
                        "which": dir.path().join("bin/python").display().to_string(),
                        "requirements": requirements.display().to_string()
                    }
                }),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, ManageError::Validation(ref fields) if fields.len() == 1 && fields[0].field == "record.python.which")
        );
    }

    #[tokio::test]
    async fn malformed_record_is_a_validation_error() {
        let err = validator()
            .decode(TargetKind::Portal, json!({"path": 7}))
            .await
            .unwrap_err();
        assert!(matches!(err, ManageError::Validation(_)));
        let err = validator()
            .decode(TargetKind::Rest, json!("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManageError::Validation(_)));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
