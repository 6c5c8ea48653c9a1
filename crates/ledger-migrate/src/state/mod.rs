//! Run state files and the per-scope run lock.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Write `value` as pretty JSON: to a temp file first, then renamed over
/// `path`.
pub fn write_json_atomic<T: Serialize + ?Sized, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, &content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Lifecycle of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Draft,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// One phase of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    /// Overall progress once this phase completes.
    pub percent: u8,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A migration run and its phase history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: String,
    pub scope: String,
    /// SHA-256 of the configuration; keys the signature.
    pub config_hash: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub dry_run: bool,
    pub batch_size: usize,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    pub error: Option<String>,

    /// HMAC-SHA256 over the serialized run without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationRun {
    pub fn new(
        scope: impl Into<String>,
        config_hash: impl Into<String>,
        (date_from, date_to): (NaiveDate, NaiveDate),
        dry_run: bool,
        batch_size: usize,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            scope: scope.into(),
            config_hash: config_hash.into(),
            date_from,
            date_to,
            dry_run,
            batch_size,
            status: RunStatus::Draft,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            phases: Vec::new(),
            error: None,
            hmac: None,
        }
    }

    /// Draft -> Running.
    pub fn start(&mut self) -> Result<()> {
        if self.status != RunStatus::Draft {
            return Err(MigrateError::State(format!(
                "run {} cannot start from status {:?}",
                self.run_id, self.status
            )));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn begin_phase(&mut self, phase: &str, percent: u8) {
        self.phases.push(PhaseRecord {
            phase: phase.to_string(),
            percent,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        });
    }

    /// Close the most recent open phase.
    pub fn end_phase(&mut self, error: Option<&str>) {
        if let Some(phase) = self.phases.iter_mut().rev().find(|p| p.completed_at.is_none()) {
            phase.completed_at = Some(Utc::now());
            phase.error = error.map(str::to_string);
        }
    }

    pub fn current_phase(&self) -> Option<&PhaseRecord> {
        self.phases.last()
    }

    pub fn mark_completed(&mut self) {
        if !self.status.is_terminal() {
            self.status = RunStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, error: &str) {
        if !self.status.is_terminal() {
            self.end_phase(Some(error));
            self.status = RunStatus::Failed;
            self.error = Some(error.to_string());
            self.completed_at = Some(Utc::now());
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign and write the run atomically.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.hmac = Some(self.compute_hmac()?);
        write_json_atomic(path, self)
    }

    /// Load a run, rejecting files whose signature does not match.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let run: Self = read_json(path)?;
        match &run.hmac {
            Some(stored) if *stored == run.compute_hmac()? => Ok(run),
            Some(_) => Err(MigrateError::State(
                "Run state integrity check failed: HMAC mismatch (possible tampering)".to_string(),
            )),
            None => Err(MigrateError::State("Run state file is not signed".to_string())),
        }
    }

    /// Whether the run was created from the configuration with this hash.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::State(format!(
                "run {} was created with a different configuration",
                self.run_id
            )));
        }
        Ok(())
    }
}

/// Exclusive lock on a target scope, held for the lifetime of the value.
#[derive(Debug)]
pub struct ScopeLock {
    path: PathBuf,
}

impl ScopeLock {
    pub fn acquire<P: AsRef<Path>>(dir: P, scope: &str, run_id: &str) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", scope));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(MigrateError::ScopeLocked {
                    scope: scope.to_string(),
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{} {}", run_id, std::process::id())?;
        debug!("Acquired scope lock {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release scope lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn run() -> MigrationRun {
        MigrationRun::new(
            "acme-2024",
            "abc123",
            (
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            ),
            false,
            100,
        )
    }

    #[test]
    fn test_run_save_load() {
        let mut state = run();
        state.start().unwrap();
        state.begin_phase("prevalidation", 10);
        state.end_phase(None);

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let loaded = MigrationRun::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.phases.len(), 1);
        assert!(loaded.phases[0].completed_at.is_some());
        assert!(loaded.validate_config("abc123").is_ok());
        assert!(loaded.validate_config("other").is_err());
    }

    #[test]
    fn test_tampered_state_rejected() {
        let mut state = run();
        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        std::fs::write(file.path(), content.replace("\"dry_run\": false", "\"dry_run\": true")).unwrap();

        let err = MigrationRun::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
    }

    #[test]
    fn test_unsigned_state_rejected() {
        let state = run();
        let file = NamedTempFile::new().unwrap();
        write_json_atomic(file.path(), &state).unwrap();
        assert!(MigrationRun::load(file.path()).is_err());
    }

    #[test]
    fn test_status_transitions() {
        let mut state = run();
        state.start().unwrap();
        assert!(state.start().is_err());

        state.begin_phase("import", 20);
        state.mark_failed("target unavailable");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.phases[0].error.as_deref(), Some("target unavailable"));

        // Terminal
        state.mark_completed();
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[test]
    fn test_scope_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let lock = ScopeLock::acquire(dir.path(), "acme", "run-1").unwrap();
        let second = ScopeLock::acquire(dir.path(), "acme", "run-2");
        assert!(matches!(second, Err(MigrateError::ScopeLocked { .. })));

        // Other scopes are independent
        let _other = ScopeLock::acquire(dir.path(), "globex", "run-3").unwrap();

        drop(lock);
        assert!(ScopeLock::acquire(dir.path(), "acme", "run-4").is_ok());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        write_json_atomic(&path, &serde_json::json!({"ok": true})).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["ok"], true);
    }
}
