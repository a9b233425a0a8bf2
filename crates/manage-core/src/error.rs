//! ---
//! manage_section: "01-core-functionality"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Error taxonomy shared by the orchestration engine."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
use std::fmt;

use manage_persistence::PersistenceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, ManageError>;

/// A single rejected field from record validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum ManageError {
    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },
    #[error("{target} is busy: {reason}")]
    Conflict { target: String, reason: String },
    #[error("{what} '{name}' already exists")]
    AlreadyExists { what: &'static str, name: String },
    #[error("repository for {target} is unreachable: {reason}")]
    RepositoryUnreachable { target: String, reason: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ManageError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn storage(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, reason)])
    }

    /// Stable machine-readable code, used by the HTTP adapter and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::AlreadyExists { .. } => "already_exists",
            Self::RepositoryUnreachable { .. } => "repository_unreachable",
            Self::Storage(_) => "storage",
            Self::Cancelled => "cancelled",
            Self::Validation(_) => "validation",
        }
    }
}

impl From<PersistenceError> for ManageError {
    fn from(err: PersistenceError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ManageError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
