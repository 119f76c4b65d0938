// SPDX-License-Identifier: MIT
//! The task store — exclusive owner of the to-do collection and its on-disk
//! JSON file.
//!
//! Every mutation follows the same copy-commit cycle: build the new
//! collection value, persist it atomically (tmp file → rename), and only
//! then replace the in-memory collection. A failed write leaves both memory
//! and disk at the last successfully completed mutation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RecoveryPolicy;

const STORE_FILE: &str = "todos.json";

// ─── Model ────────────────────────────────────────────────────────────────────

/// One to-do item. Wire and disk representation are identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub text: String,
    pub completed: bool,
}

/// On-disk document: the full collection under a fixed `"todos"` key.
#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    todos: Vec<Task>,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ─── TaskStore ────────────────────────────────────────────────────────────────

struct Inner {
    tasks: Vec<Task>,
    /// Highest id ever assigned or loaded. Ids are `max(now_millis, last + 1)`
    /// so they stay strictly increasing even for adds within one millisecond.
    last_id: i64,
}

/// Owns the task collection. All access goes through the mutex, so every
/// read-modify-persist cycle is serialized even with multiple connected
/// clients.
pub struct TaskStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl TaskStore {
    /// Load the store from `{data_dir}/todos.json`, or start empty if the
    /// file does not exist yet.
    ///
    /// A malformed file is handled per `recovery`: `Permissive` logs a
    /// warning and starts empty, `Strict` fails startup.
    pub async fn open(data_dir: &Path, recovery: RecoveryPolicy) -> Result<Self, StoreError> {
        let path = data_dir.join(STORE_FILE);
        let tasks = match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<StoreFile>(&contents) {
                Ok(file) => file.todos,
                Err(e) => match recovery {
                    RecoveryPolicy::Permissive => {
                        warn!(
                            path = %path.display(),
                            err = %e,
                            "todos.json is malformed — starting with an empty collection"
                        );
                        Vec::new()
                    }
                    RecoveryPolicy::Strict => return Err(e.into()),
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let last_id = tasks.iter().map(|t| t.id).max().unwrap_or(0);
        debug!(count = tasks.len(), last_id, "task store loaded");

        Ok(Self {
            path,
            inner: Mutex::new(Inner { tasks, last_id }),
        })
    }

    /// Current collection, unchanged. Never touches the disk.
    pub async fn list(&self) -> Vec<Task> {
        self.inner.lock().await.tasks.clone()
    }

    /// Number of tasks (for `daemon.status` / health reporting).
    pub async fn count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    /// Append a new task and persist. The store is deliberately permissive
    /// about empty or whitespace-only text — filtering is the caller's call.
    pub async fn add(&self, text: &str) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.inner.lock().await;

        let id = next_id(inner.last_id);
        let mut updated = inner.tasks.clone();
        updated.push(Task {
            id,
            text: text.to_string(),
            completed: false,
        });

        self.persist(&updated).await?;
        inner.last_id = id;
        inner.tasks = updated.clone();
        debug!(id, "task added");
        Ok(updated)
    }

    /// Flip `completed` on the matching task and persist. Unknown ids are a
    /// no-op, not an error — the caller never has to pre-check existence.
    pub async fn toggle(&self, id: i64) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.inner.lock().await;

        let mut updated = inner.tasks.clone();
        match updated.iter_mut().find(|t| t.id == id) {
            Some(task) => task.completed = !task.completed,
            None => {
                debug!(id, "toggle on unknown id — no-op");
                return Ok(updated);
            }
        }

        self.persist(&updated).await?;
        inner.tasks = updated.clone();
        Ok(updated)
    }

    /// Remove the matching task and persist. Unknown ids are a no-op.
    pub async fn delete(&self, id: i64) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.inner.lock().await;

        let mut updated = inner.tasks.clone();
        let before = updated.len();
        updated.retain(|t| t.id != id);
        if updated.len() == before {
            debug!(id, "delete on unknown id — no-op");
            return Ok(updated);
        }

        self.persist(&updated).await?;
        inner.tasks = updated.clone();
        debug!(id, "task deleted");
        Ok(updated)
    }

    /// Atomic write: serialize the whole collection, write to a tmp file,
    /// then rename over the canonical path so readers never observe a
    /// partially written document.
    async fn persist(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let doc = StoreFile {
            todos: tasks.to_vec(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Next task id: wall-clock milliseconds, bumped past the previous id when
/// the clock has not advanced (or moved backwards) since the last assignment.
fn next_id(last_id: i64) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    now.max(last_id + 1)
}
