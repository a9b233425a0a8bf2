//! ---
//! manage_section: "03-persistence-logging"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Persistence abstractions and storage bindings."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Durable storage primitives: the append-only job journal, hashed manifest
//! envelopes for backups, and directory copy/digest/swap helpers used when
//! snapshotting and promoting deployed artifacts.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for directory traversal failures.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    /// Reported when a manifest fails integrity verification.
    #[error("manifest hash mismatch")]
    HashMismatch,
    /// A journal line other than the trailing one could not be decoded.
    #[error("corrupt journal entry at line {line}: {reason}")]
    CorruptJournal {
        /// One-based line number within the journal file.
        line: usize,
        /// Decoder message.
        reason: String,
    },
    /// The manifest was written by an incompatible format version.
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u16),
}

pub mod event_log;
pub mod snapshot;
pub mod tree;

pub use event_log::{replay, EventLogEntry, EventLogWriter};
pub use snapshot::{read_manifest, verify_manifest, write_manifest, MANIFEST_VERSION};
pub use tree::{copy_tree, digest_tree, replace_dir, sibling_path, write_json_atomic, TreeDigest};
