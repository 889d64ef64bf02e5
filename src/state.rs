//! Incremental state persistence shared by every block of a run.
//!
//! One `StateStore` is opened per invocation and handed by reference to each
//! block-set; `close` consumes it, so it can only be closed once.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::util::sanitize_filename;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("a run for state '{state_id}' is already in progress; pass --force to run anyway")]
    Locked { state_id: String },

    #[error("state store I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid state document {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    state_id: String,
    updated_at: String,
    value: serde_json::Value,
}

#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    held_locks: Mutex<HashSet<String>>,
}

impl StateStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StateError::Io {
            path: dir.clone(),
            source,
        })?;
        debug!(dir = ?dir, "state store opened");
        Ok(Self {
            dir,
            held_locks: Mutex::new(HashSet::new()),
        })
    }

    fn state_path(&self, state_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_filename(state_id)))
    }

    fn lock_path(&self, state_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_filename(state_id)))
    }

    pub fn get(&self, state_id: &str) -> Result<Option<serde_json::Value>, StateError> {
        let path = self.state_path(state_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Io { path, source }),
        };
        let doc: StateDocument =
            serde_json::from_str(&content).map_err(|source| StateError::Json { path, source })?;
        Ok(Some(doc.value))
    }

    pub fn put(&self, state_id: &str, value: serde_json::Value) -> Result<(), StateError> {
        let path = self.state_path(state_id);
        let doc = StateDocument {
            state_id: state_id.to_string(),
            updated_at: Utc::now().to_rfc3339(),
            value,
        };
        let content = serde_json::to_string_pretty(&doc).map_err(|source| StateError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, content).map_err(|source| StateError::Io { path, source })?;
        debug!(state_id, "state saved");
        Ok(())
    }

    /// Mark `state_id` as running. Fails when another run holds it, unless `force`.
    pub fn acquire(&self, state_id: &str, force: bool) -> Result<(), StateError> {
        let path = self.lock_path(state_id);
        if path.exists() {
            if !force {
                return Err(StateError::Locked {
                    state_id: state_id.to_string(),
                });
            }
            warn!(state_id, "overriding existing run lock");
        }
        std::fs::write(&path, Utc::now().to_rfc3339())
            .map_err(|source| StateError::Io { path, source })?;
        self.held_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state_id.to_string());
        Ok(())
    }

    pub fn release(&self, state_id: &str) {
        let held = self
            .held_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(state_id);
        if held {
            remove_quietly(&self.lock_path(state_id));
        }
    }

    /// Release every lock this session still holds.
    pub fn close(self) {
        let held: Vec<String> = self
            .held_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for state_id in held {
            remove_quietly(&self.lock_path(&state_id));
        }
        debug!(dir = ?self.dir, "state store closed");
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.get("dev:tap-a-to-target-b").unwrap().is_none());
        store
            .put("dev:tap-a-to-target-b", json!({"bookmarks": {"users": 42}}))
            .unwrap();
        let value = store.get("dev:tap-a-to-target-b").unwrap().unwrap();
        assert_eq!(value["bookmarks"]["users"], 42);
    }

    #[test]
    fn test_lock_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let first = StateStore::open(dir.path()).unwrap();
        first.acquire("job", false).unwrap();

        let second = StateStore::open(dir.path()).unwrap();
        assert!(matches!(
            second.acquire("job", false),
            Err(StateError::Locked { .. })
        ));
        second.acquire("job", true).unwrap();
        second.close();

        first.release("job");
        first.acquire("job", false).unwrap();
        first.close();
        assert!(!dir.path().join("job.lock").exists());
    }
}
