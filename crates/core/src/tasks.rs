use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::status::now_unix_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Preparing,
    Downloading,
    Uploading,
    Finalizing,
}

/// Observability record for one in-flight transfer. Never persisted; the
/// registry starts empty after every restart.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEntry {
    pub user_id: i64,
    pub message_id: i64,
    pub link: String,
    pub stage: TaskStage,
    pub session_label: String,
    pub current_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    pub started_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub user_id: i64,
    pub message_id: i64,
}

#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<TaskKey, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: TaskKey, link: &str) {
        let now = now_unix_ms();
        let entry = TaskEntry {
            user_id: key.user_id,
            message_id: key.message_id,
            link: link.to_string(),
            stage: TaskStage::Preparing,
            session_label: String::new(),
            current_bytes: 0,
            total_bytes: None,
            percent: None,
            started_at_ms: now,
            updated_at_ms: now,
        };
        self.entries
            .lock()
            .expect("task registry mutex poisoned")
            .insert(key, entry);
    }

    pub fn set_stage(&self, key: TaskKey, stage: TaskStage) {
        let mut entries = self.entries.lock().expect("task registry mutex poisoned");
        if let Some(entry) = entries.get_mut(&key) {
            entry.stage = stage;
            entry.updated_at_ms = now_unix_ms();
        }
    }

    pub fn set_session(&self, key: TaskKey, label: &str) {
        let mut entries = self.entries.lock().expect("task registry mutex poisoned");
        if let Some(entry) = entries.get_mut(&key) {
            entry.session_label = label.to_string();
            entry.updated_at_ms = now_unix_ms();
        }
    }

    pub fn update_progress(&self, key: TaskKey, current: u64, total: Option<u64>) {
        let mut entries = self.entries.lock().expect("task registry mutex poisoned");
        if let Some(entry) = entries.get_mut(&key) {
            entry.current_bytes = current;
            entry.total_bytes = total;
            entry.percent = total
                .filter(|t| *t > 0)
                .map(|t| (current as f64 / t as f64) * 100.0);
            entry.updated_at_ms = now_unix_ms();
        }
    }

    pub fn remove(&self, key: TaskKey) {
        self.entries
            .lock()
            .expect("task registry mutex poisoned")
            .remove(&key);
    }

    pub fn snapshot(&self) -> Vec<TaskEntry> {
        let entries = self.entries.lock().expect("task registry mutex poisoned");
        let mut out: Vec<TaskEntry> = entries.values().cloned().collect();
        out.sort_by_key(|e| e.started_at_ms);
        out
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("task registry mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.entries
            .lock()
            .expect("task registry mutex poisoned")
            .clear();
    }
}

/// Per-user cooperative cancellation. A token is created lazily when a
/// transfer starts, triggered by `/cancel` or automated flood handling, and
/// replaced when the user starts a new operation.
#[derive(Default)]
pub struct CancelManager {
    tokens: Mutex<HashMap<i64, (CancellationToken, Instant)>>,
}

impl CancelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh token for a new operation; any previous flag for the user is
    /// discarded.
    pub fn begin(&self, user_id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("cancel manager mutex poisoned")
            .insert(user_id, (token.clone(), Instant::now()));
        token
    }

    /// Trips the user's flag. Returns false when nothing was in flight.
    pub fn cancel(&self, user_id: i64) -> bool {
        let tokens = self.tokens.lock().expect("cancel manager mutex poisoned");
        match tokens.get(&user_id) {
            Some((token, _)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, user_id: i64) -> bool {
        let tokens = self.tokens.lock().expect("cancel manager mutex poisoned");
        tokens
            .get(&user_id)
            .is_some_and(|(token, _)| token.is_cancelled())
    }

    /// Called when the transfer that observed the flag finishes.
    pub fn clear(&self, user_id: i64) {
        self.tokens
            .lock()
            .expect("cancel manager mutex poisoned")
            .remove(&user_id);
    }

    pub fn reset(&self) {
        self.tokens
            .lock()
            .expect("cancel manager mutex poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_stage_and_progress() {
        let registry = TaskRegistry::new();
        let key = TaskKey {
            user_id: 1,
            message_id: 10,
        };
        registry.insert(key, "t.me/c/1/10");
        registry.set_stage(key, TaskStage::Downloading);
        registry.update_progress(key, 50, Some(200));

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].stage, TaskStage::Downloading);
        assert_eq!(snap[0].percent, Some(25.0));

        registry.remove(key);
        assert!(registry.is_empty());
    }

    #[test]
    fn begin_replaces_previous_flag() {
        let cancels = CancelManager::new();
        cancels.begin(7);
        assert!(cancels.cancel(7));
        assert!(cancels.is_cancelled(7));

        // A new operation starts with a clean flag.
        let token = cancels.begin(7);
        assert!(!token.is_cancelled());
        assert!(!cancels.is_cancelled(7));
    }

    #[test]
    fn cancel_without_operation_reports_false() {
        let cancels = CancelManager::new();
        assert!(!cancels.cancel(42));
    }
}
