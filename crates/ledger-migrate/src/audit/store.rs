//! Append-only storage for audit trails.
//!
//! A trail is a sequence of [`AuditLine`]s: one header, then entries
//! interleaved with rolling statistics. [`JsonlFileStore`] writes one JSON
//! document per line and only ever appends.

use super::{AuditEntry, AuditHeader, AuditStatistics};
use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One persisted line of an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditLine {
    Header(AuditHeader),
    Entry(AuditEntry),
    Statistics(AuditStatistics),
}

/// Append-only sink for audit lines.
pub trait AuditStore: Send + Sync {
    /// Append lines in order. Lines already appended are never rewritten.
    fn append(&self, lines: &[AuditLine]) -> Result<()>;

    /// Human-readable location for logs and reports.
    fn location(&self) -> String;
}

/// JSON Lines file store.
#[derive(Debug)]
pub struct JsonlFileStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFileStore {
    /// Open (or create) the file in append mode, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for JsonlFileStore {
    fn append(&self, lines: &[AuditLine]) -> Result<()> {
        let mut buf = Vec::new();
        for line in lines {
            serde_json::to_writer(&mut buf, line)?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store, used for dry runs without an output directory and in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    lines: Mutex<Vec<AuditLine>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: AuditLine) {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).push(line);
    }

    pub fn lines(&self) -> Vec<AuditLine> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lines()
            .into_iter()
            .filter_map(|line| match line {
                AuditLine::Entry(entry) => Some(entry),
                _ => None,
            })
            .collect()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, lines: &[AuditLine]) -> Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(lines);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Read every line of a JSON Lines audit file.
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<AuditLine>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str(&line).map_err(|e| {
            MigrateError::State(format!(
                "{}:{}: invalid audit line: {}",
                path.display(),
                number + 1,
                e
            ))
        })?;
        lines.push(parsed);
    }
    Ok(lines)
}
