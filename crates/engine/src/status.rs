//! Observable queue status.
//!
//! The engine is the only writer. Observers read snapshots or subscribe to
//! patch events; they never mutate entries.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sliceup_protocol::{QueueStatusEntry, TaskStatus};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Change notification published after every patch.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The full entry after the patch was applied.
    Updated(QueueStatusEntry),
    /// The entry was cleared from the store.
    Removed(String),
}

/// Partial update of one entry. `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub(crate) struct StatusPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl StatusPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<String, QueueStatusEntry>,
    order: Vec<String>,
}

/// Task id → [`QueueStatusEntry`] map, patched by key.
#[derive(Debug)]
pub struct StatusStore {
    entries: RwLock<Entries>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(Entries::default()),
            events,
        }
    }

    /// Subscribes to patch events. Slow receivers may observe
    /// [`broadcast::error::RecvError::Lagged`] and should re-read
    /// [`snapshot`](Self::snapshot).
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Returns the entry of one task.
    pub fn get(&self, task_id: &str) -> Option<QueueStatusEntry> {
        self.read().by_id.get(task_id).cloned()
    }

    /// Returns all entries in enqueue order.
    pub fn snapshot(&self) -> Vec<QueueStatusEntry> {
        let entries = self.read();
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds (or replaces) the entry of a freshly enqueued task.
    pub(crate) fn insert(&self, entry: QueueStatusEntry) {
        {
            let mut entries = self.write();
            if entries
                .by_id
                .insert(entry.task_id.clone(), entry.clone())
                .is_none()
            {
                entries.order.push(entry.task_id.clone());
            }
        }
        let _ = self.events.send(StatusEvent::Updated(entry));
    }

    /// Merges `patch` into the entry of `task_id`.
    ///
    /// Progress never decreases unless the entry ends up failed or
    /// cancelled. Patches without a status change are ignored once the
    /// entry is terminal, so late progress reports cannot overwrite it.
    pub(crate) fn patch(&self, task_id: &str, patch: StatusPatch) -> Option<QueueStatusEntry> {
        let updated = {
            let mut entries = self.write();
            let entry = entries.by_id.get_mut(task_id)?;

            if patch.status.is_none() && entry.lifecycle_status.is_terminal() {
                return None;
            }
            if let Some(status) = patch.status {
                entry.lifecycle_status = status;
            }
            if let Some(progress) = patch.progress {
                let progress = progress.clamp(0.0, 100.0);
                let may_regress = matches!(
                    entry.lifecycle_status,
                    TaskStatus::Failed | TaskStatus::Cancelled
                );
                if progress >= entry.progress_percent || may_regress {
                    entry.progress_percent = progress;
                }
            }
            if let Some(message) = patch.message {
                entry.status_message = message;
            }
            if let Some(error) = patch.error {
                entry.error = error;
            }
            entry.clone()
        };
        let _ = self.events.send(StatusEvent::Updated(updated.clone()));
        Some(updated)
    }

    /// Removes the entry of `task_id`.
    pub(crate) fn remove(&self, task_id: &str) -> bool {
        let removed = {
            let mut entries = self.write();
            let removed = entries.by_id.remove(task_id).is_some();
            if removed {
                entries.order.retain(|id| id != task_id);
            }
            removed
        };
        if removed {
            let _ = self.events.send(StatusEvent::Removed(task_id.to_string()));
        }
        removed
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
