//! Persisted supervisor flags
//!
//! The flags outlive the process so a relaunch helper started later can tell
//! whether a human asked for the stop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::StateError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    /// Best-effort external visibility that ingestion is running
    #[serde(default)]
    pub is_running: bool,
    /// Set only by an explicit stop request
    #[serde(default)]
    pub intentional_stop: bool,
    /// Token of the one-shot relaunch currently scheduled, if any
    #[serde(default)]
    pub pending_relaunch: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<SupervisorState, StateError>;

    fn save(&self, state: &SupervisorState) -> Result<(), StateError>;

    /// Read-modify-write; returns the saved state
    fn update(
        &self,
        apply: &mut dyn FnMut(&mut SupervisorState),
    ) -> Result<SupervisorState, StateError> {
        let mut state = self.load()?;
        apply(&mut state);
        state.updated_at = Some(Utc::now());
        self.save(&state)?;
        Ok(state)
    }
}

/// JSON file store; a missing file reads as the default state
pub struct FileStateStore {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SupervisorState, StateError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SupervisorState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, state: &SupervisorState) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Supervisor state saved");
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<SupervisorState, StateError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    fn save(&self, state: &SupervisorState) -> Result<(), StateError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(state)
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut SupervisorState),
    ) -> Result<SupervisorState, StateError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.read()?;
        apply(&mut state);
        state.updated_at = Some(Utc::now());
        self.write(&state)?;
        Ok(state)
    }
}

/// In-process store for tests and embedding
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<SupervisorState>,
}

impl MemoryStateStore {
    pub fn new(state: SupervisorState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<SupervisorState, StateError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, state: &SupervisorState) -> Result<(), StateError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        Ok(())
    }
}
