//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Portal and REST target records."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Deployable units tracked by the management service.
//!
//! A portal is a front-end site built from a repository into an output
//! directory; a REST entry is a backend service whose repository is updated
//! in place and whose supervisor programs are restarted afterwards.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ManageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Portal,
    Rest,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Portal => "portal",
            TargetKind::Rest => "rest",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = ManageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "portal" | "portals" => Ok(TargetKind::Portal),
            "rest" => Ok(TargetKind::Rest),
            other => Err(ManageError::invalid("kind", format!("unknown kind '{other}'"))),
        }
    }
}

/// Identity of a target across the orchestrator, store, and history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub kind: TargetKind,
    pub name: String,
}

impl TargetKey {
    pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn portal(name: impl Into<String>) -> Self {
        Self::new(TargetKind::Portal, name)
    }

    pub fn rest(name: impl Into<String>) -> Self {
        Self::new(TargetKind::Rest, name)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

fn default_dist() -> String {
    "dist".to_owned()
}

fn default_portal_commands() -> Vec<String> {
    vec!["npm install".to_owned(), "npm run build".to_owned()]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// nvm alias activated before every build command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSpec {
    /// Working copy of the site repository.
    pub path: String,
    /// Directory the built site is served from.
    pub output: String,
    /// Build output, relative to `path`.
    #[serde(default = "default_dist")]
    pub dist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default = "default_portal_commands")]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonSettings {
    /// Interpreter used for dependency installation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub which: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Supervisor program name; the service key is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestSpec {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub python: PythonSettings,
    #[serde(default)]
    pub services: IndexMap<String, ServiceSettings>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl RestSpec {
    /// Supervisor programs to restart, in declaration order.
    pub fn supervisor_programs(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|(name, service)| service.supervisor.clone().unwrap_or_else(|| name.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetSpec {
    Portal(PortalSpec),
    Rest(RestSpec),
}

impl TargetSpec {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetSpec::Portal(_) => TargetKind::Portal,
            TargetSpec::Rest(_) => TargetKind::Rest,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            TargetSpec::Portal(spec) => &spec.path,
            TargetSpec::Rest(spec) => &spec.path,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            TargetSpec::Portal(spec) => spec.branch.as_deref(),
            TargetSpec::Rest(spec) => spec.branch.as_deref(),
        }
    }

    pub fn as_portal(&self) -> Option<&PortalSpec> {
        match self {
            TargetSpec::Portal(spec) => Some(spec),
            TargetSpec::Rest(_) => None,
        }
    }

    /// Record body without the `kind` tag, as stored and served.
    pub fn to_record(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            TargetSpec::Portal(spec) => serde_json::to_value(spec),
            TargetSpec::Rest(spec) => serde_json::to_value(spec),
        }
    }

    /// Decode a record body for the given kind.
    pub fn from_record(kind: TargetKind, record: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            TargetKind::Portal => TargetSpec::Portal(serde_json::from_value(record)?),
            TargetKind::Rest => TargetSpec::Rest(serde_json::from_value(record)?),
        })
    }
}

/// A configured target together with its deployed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub spec: TargetSpec,
    /// Revision of the most recent successful build or restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl Target {
    pub fn new(name: impl Into<String>, spec: TargetSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            revision: None,
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.spec.kind(), self.name.clone())
    }

    pub fn kind(&self) -> TargetKind {
        self.spec.kind()
    }
}
