//! Persisted run state.
//!
//! One `state.json` per run, rewritten whole on every mutation via a temp
//! file and a rename so readers never observe a partial write.
//!
//! ```text
//! <state_dir>/<run_id>/
//! ├── state.json
//! ├── run.lock
//! ├── reports/
//! ├── consensus/
//! ├── instructions/
//! └── logs/
//! ```

use crate::errors::EngineError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

pub const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "run.lock";
const STATE_LOCK_FILE: &str = "state.lock";

/// Reserved `metadata` keys used by the engine.
pub mod keys {
    pub const PRE_ABORT_STATUS: &str = "pre_abort_status";
    pub const PENDING_ARTIFACTS: &str = "pending_artifacts";
    pub const LAST_FAILURE: &str = "last_failure";
    pub const ATTEMPTS: &str = "attempts";
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    AwaitingConsensus,
    NeedsRevision,
    Aborted,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::AwaitingConsensus => "awaiting_consensus",
            RunStatus::NeedsRevision => "needs_revision",
            RunStatus::Aborted => "aborted",
            RunStatus::Completed => "completed",
        }
    }

    /// `Completed` is the only terminal status; `Aborted` is suspended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }

    /// Statuses from which `advance()` may run a phase.
    pub fn can_advance(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::NeedsRevision)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(RunStatus::Idle),
            "running" => Ok(RunStatus::Running),
            "awaiting_consensus" => Ok(RunStatus::AwaitingConsensus),
            "needs_revision" => Ok(RunStatus::NeedsRevision),
            "aborted" => Ok(RunStatus::Aborted),
            "completed" => Ok(RunStatus::Completed),
            _ => anyhow::bail!("Invalid run status '{}'", s),
        }
    }
}

/// Why the last phase attempt failed, kept for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: String,
    pub agent_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<crate::checkpoint::ValidationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

/// The single unit of persisted truth for one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
    pub phase_artifacts: BTreeMap<String, Vec<String>>,
    pub awaiting_consensus: bool,
    pub consensus_phase: Option<String>,
    pub intake_summary: Value,
    pub metadata: Map<String, Value>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// A fresh, idle run with a new identifier.
    pub fn new(intake_summary: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &Uuid::new_v4().to_string()[..8]),
            status: RunStatus::Idle,
            current_phase: None,
            completed_phases: Vec::new(),
            phase_artifacts: BTreeMap::new(),
            awaiting_consensus: false,
            consensus_phase: None,
            intake_summary,
            metadata: Map::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self, phase: &str) -> bool {
        self.completed_phases.iter().any(|p| p == phase)
    }

    /// Status to restore on `resume()`, recorded by `abort()`.
    pub fn pre_abort_status(&self) -> Option<RunStatus> {
        self.metadata
            .get(keys::PRE_ABORT_STATUS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn last_failure(&self) -> Option<PhaseFailure> {
        self.metadata
            .get(keys::LAST_FAILURE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn pending_artifacts(&self) -> Vec<String> {
        self.metadata
            .get(keys::PENDING_ARTIFACTS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Number of attempts made so far at `phase`.
    pub fn attempts(&self, phase: &str) -> u32 {
        self.metadata
            .get(keys::ATTEMPTS)
            .and_then(|v| v.get(phase))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(0)
    }

    pub(crate) fn bump_attempts(&mut self, phase: &str) -> u32 {
        let next = self.attempts(phase) + 1;
        let entry = self
            .metadata
            .entry(keys::ATTEMPTS)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(phase.to_string(), Value::from(next));
        }
        next
    }

    pub(crate) fn set_meta<T: Serialize>(&mut self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.metadata.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to encode run metadata"),
        }
    }

    pub(crate) fn clear_meta(&mut self, key: &str) {
        self.metadata.remove(key);
    }
}

/// Reads and writes run state under a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.state_path(run_id).exists()
    }

    /// Atomically replace the persisted state, refreshing `updated_at`.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        let dir = self.run_dir(&state.run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;

        state.updated_at = Utc::now();
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize run state")?;

        let path = self.state_path(&state.run_id);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write temp state file: {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

        tracing::debug!(run_id = %state.run_id, status = %state.status, "run state persisted");
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<RunState, EngineError> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(state)
    }

    /// All runs, most recently updated first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<RunState>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<RunState> = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read state directory: {}", self.root.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(STATE_FILE).exists())
            .filter_map(|e| {
                let id = e.file_name().to_string_lossy().to_string();
                match self.load(&id) {
                    Ok(state) => Some(state),
                    Err(err) => {
                        tracing::warn!(run_id = %id, error = %err, "skipping unreadable run");
                        None
                    }
                }
            })
            .collect();

        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs)
    }

    /// Take the advisory single-writer lock for `run_id`.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn lock(&self, run_id: &str) -> Result<RunLock, EngineError> {
        let file = self.open_lock_file(run_id, LOCK_FILE)?;
        file.try_lock_exclusive()
            .map_err(|_| EngineError::RunLocked(run_id.to_string()))?;
        Ok(RunLock { file })
    }

    /// Block until no other writer is between reading and replacing
    /// `state.json` for `run_id`.
    ///
    /// Held only around a read-modify-write of the state file, including by
    /// writers that do not hold the run lock.
    pub fn write_lock(&self, run_id: &str) -> Result<RunLock, EngineError> {
        let file = self.open_lock_file(run_id, STATE_LOCK_FILE)?;
        file.lock_exclusive()
            .context("Failed to lock run state for writing")?;
        Ok(RunLock { file })
    }

    fn open_lock_file(&self, run_id: &str, name: &str) -> Result<fs::File> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        let path = dir.join(name);
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))
    }
}

/// Advisory file lock on a run, released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: fs::File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_new_state_is_idle() {
        let state = RunState::new(json!({"project": "x"}));
        assert_eq!(state.status, RunStatus::Idle);
        assert!(state.current_phase.is_none());
        assert!(state.completed_phases.is_empty());
        assert!(!state.awaiting_consensus);
        assert_eq!(state.run_id.len(), "20260101-000000-abcdef12".len());
    }

    #[test]
    fn test_save_and_load_roundtrip_refreshes_updated_at() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = RunState::new(json!({}));
        let before = state.updated_at;
        state.status = RunStatus::Running;
        state.current_phase = Some("ingest".into());
        store.save(&mut state).unwrap();

        let loaded = store.load(&state.run_id).unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.updated_at >= before);
        assert!(!store.state_path(&state.run_id).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_persisted_record_has_exactly_the_run_fields() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = RunState::new(json!(null));
        store.save(&mut state).unwrap();
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(store.state_path(&state.run_id)).unwrap())
                .unwrap();
        let mut keys: Vec<&str> = raw.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "awaiting_consensus",
                "completed_phases",
                "consensus_phase",
                "created_at",
                "current_phase",
                "errors",
                "intake_summary",
                "metadata",
                "phase_artifacts",
                "run_id",
                "status",
                "updated_at"
            ]
        );
        assert_eq!(raw["status"], "idle");
    }

    #[test]
    fn test_load_missing_run_is_not_found() {
        let dir = tempdir().unwrap();
        let err = StateStore::new(dir.path()).load("nope").unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(id) if id == "nope"));
    }

    #[test]
    fn test_list_returns_most_recent_first() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut first = RunState::new(json!({}));
        store.save(&mut first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut second = RunState::new(json!({}));
        store.save(&mut second).unwrap();

        let runs = store.list().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second.run_id);
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let guard = store.lock("run-a").unwrap();
        assert!(matches!(
            store.lock("run-a").unwrap_err(),
            EngineError::RunLocked(_)
        ));
        drop(guard);
        assert!(store.lock("run-a").is_ok());
    }

    #[test]
    fn test_write_lock_waits_for_holder_and_ignores_run_lock() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let _run_lock = store.lock("run-a").unwrap();
        let guard = store.write_lock("run-a").unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let store = store.clone();
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _guard = store.write_lock("run-a").unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_metadata_helpers() {
        let mut state = RunState::new(json!({}));
        assert_eq!(state.attempts("ingest"), 0);
        assert_eq!(state.bump_attempts("ingest"), 1);
        assert_eq!(state.bump_attempts("ingest"), 2);
        assert_eq!(state.attempts("review"), 0);

        state.set_meta(keys::PRE_ABORT_STATUS, &RunStatus::NeedsRevision);
        assert_eq!(state.pre_abort_status(), Some(RunStatus::NeedsRevision));
        state.clear_meta(keys::PRE_ABORT_STATUS);
        assert_eq!(state.pre_abort_status(), None);

        state.set_meta(keys::PENDING_ARTIFACTS, &vec!["a.txt"]);
        assert_eq!(state.pending_artifacts(), vec!["a.txt"]);
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [
            RunStatus::Idle,
            RunStatus::Running,
            RunStatus::AwaitingConsensus,
            RunStatus::NeedsRevision,
            RunStatus::Aborted,
            RunStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Aborted.is_terminal());
    }
}
