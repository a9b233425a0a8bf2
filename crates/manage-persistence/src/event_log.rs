//! ---
//! manage_section: "03-persistence-logging"
//! manage_subsection: "module"
//! manage_type: "source"
//! manage_scope: "code"
//! manage_description: "Persistence abstractions and storage bindings."
//! manage_version: "v0.0.0-prealpha"
//! manage_owner: "tbd"
//! ---
//! Append-only JSON-lines journal.
//!
//! The first line is a header; each following line is one [`EventLogEntry`].
//! A torn final line (the process died mid-append) is skipped on replay, any
//! other undecodable line is reported as [`PersistenceError::CorruptJournal`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{snapshot::MANIFEST_VERSION, PersistenceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry<T> {
    /// Sequence assigned when appending, starting at 1.
    pub sequence: u64,
    /// Timestamp when the record was appended.
    pub recorded_at: DateTime<Utc>,
    /// Journal payload.
    pub record: T,
}

/// Append-only writer for a typed journal.
pub struct EventLogWriter<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    _record: PhantomData<fn(T)>,
}

impl<T> EventLogWriter<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open a journal for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            truncate_torn_tail(path)?;
        }
        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let last_sequence = if fresh {
            0
        } else {
            let mut last = 0u64;
            replay::<T, _>(path, |entry| {
                last = entry.sequence;
                Ok(())
            })?;
            last
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            let header = EventLogHeader {
                version: MANIFEST_VERSION,
                created_at: Utc::now(),
            };
            writer.write_all(serde_json::to_string(&header)?.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence: last_sequence,
            _record: PhantomData,
        })
    }

    /// Append a record and return the assigned sequence number.
    pub fn append(&mut self, record: &T) -> Result<u64> {
        let entry = EventLogEntry {
            sequence: self.next_sequence + 1,
            recorded_at: Utc::now(),
            record,
        };
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.next_sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Sequence number of the most recent record, zero when empty.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Path of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Drop a partially written final line so later appends start on a clean line.
fn truncate_torn_tail(path: &Path) -> Result<()> {
    let bytes = fs::read(path)?;
    if bytes.is_empty() || bytes.last() == Some(&b'\n') {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    warn!(path = %path.display(), dropped = bytes.len() - keep, "truncating torn journal tail");
    OpenOptions::new().write(true).open(path)?.set_len(keep as u64)?;
    Ok(())
}

/// Replay the journal in order, invoking the callback for each record.
///
/// Returns the number of records delivered. A missing file replays nothing.
pub fn replay<T, F>(path: &Path, mut handler: F) -> Result<usize>
where
    T: DeserializeOwned,
    F: FnMut(EventLogEntry<T>) -> Result<()>,
{
    if !path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
    let last_index = lines.len().saturating_sub(1);
    let mut count = 0usize;
    for (index, line) in lines.iter().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry<T>>(line) {
            Ok(entry) => {
                handler(entry)?;
                count += 1;
            }
            Err(err) if index == last_index => {
                warn!(path = %path.display(), line = index + 1, error = %err, "skipping torn journal tail");
            }
            Err(err) => {
                return Err(PersistenceError::CorruptJournal {
                    line: index + 1,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[test]
    fn sequences_continue_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.log");
        {
            let mut writer = EventLogWriter::<Value>::open(&path).unwrap();
            assert_eq!(writer.append(&json!({"job": "a"})).unwrap(), 1);
            assert_eq!(writer.append(&json!({"job": "b"})).unwrap(), 2);
        }
        let mut writer = EventLogWriter::<Value>::open(&path).unwrap();
        assert_eq!(writer.last_sequence(), 2);
        assert_eq!(writer.append(&json!({"job": "c"})).unwrap(), 3);
    }

    #[test]
    fn torn_tail_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.log");
        let mut writer = EventLogWriter::<Value>::open(&path).unwrap();
        writer.append(&json!({"job": "a"})).unwrap();
        drop(writer);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence\":2,\"recorded_").unwrap();

        let mut seen = Vec::new();
        let count = replay::<Value, _>(&path, |entry| {
            seen.push(entry.record["job"].clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![json!("a")]);

        let mut writer = EventLogWriter::<Value>::open(&path).unwrap();
        assert_eq!(writer.append(&json!({"job": "b"})).unwrap(), 2);
        let count = replay::<Value, _>(&path, |_| Ok(())).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.log");
        let mut writer = EventLogWriter::<Value>::open(&path).unwrap();
        writer.append(&json!({"job": "a"})).unwrap();
        drop(writer);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n").unwrap();
        drop(file);
        let mut writer = OpenOptions::new().append(true).open(&path).unwrap();
        writer
            .write_all(b"{\"sequence\":3,\"recorded_at\":\"2026-01-01T00:00:00Z\",\"record\":{}}\n")
            .unwrap();

        let err = replay::<Value, _>(&path, |_| Ok(())).unwrap_err();
        assert!(matches!(err, PersistenceError::CorruptJournal { line: 3, .. }));
    }
}
