use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Tracks scratch files created by in-flight transfers so they can be removed
/// in finalize paths and swept if a crash leaves them behind.
pub struct CleanupManager {
    scratch_dir: PathBuf,
    tracked: Mutex<HashSet<PathBuf>>,
}

impl CleanupManager {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Allocates a scratch path for one transfer and starts tracking it.
    pub fn scratch_path(&self, user_id: i64, message_id: i64) -> PathBuf {
        let path = self.scratch_dir.join(format!("dl_{user_id}_{message_id}"));
        self.track(&path);
        path
    }

    pub fn track(&self, path: &Path) {
        self.tracked
            .lock()
            .expect("cleanup mutex poisoned")
            .insert(path.to_path_buf());
    }

    /// Best-effort delete; a missing file is not an error.
    pub async fn remove(&self, path: &Path) {
        self.tracked
            .lock()
            .expect("cleanup mutex poisoned")
            .remove(path);
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(event = "cleanup.removed", path = %path.display(), "cleanup.removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    event = "cleanup.remove_failed",
                    path = %path.display(),
                    error = %e,
                    "cleanup.remove_failed"
                );
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().expect("cleanup mutex poisoned").len()
    }

    /// Deletes untracked scratch files older than `max_age`. Tracked files
    /// belong to live transfers and are left alone.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.scratch_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(event = "cleanup.sweep_failed", error = %e, "cleanup.sweep_failed");
                return 0;
            }
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if self
                .tracked
                .lock()
                .expect("cleanup mutex poisoned")
                .contains(&path)
            {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let old_enough = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|age| age >= max_age);
            if old_enough && tokio::fs::remove_file(&path).await.is_ok() {
                debug!(event = "cleanup.swept", path = %path.display(), "cleanup.swept");
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_deletes_and_untracks() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CleanupManager::new(dir.path().to_path_buf());
        let path = mgr.scratch_path(7, 42);
        tokio::fs::write(&path, b"x").await.unwrap();
        assert_eq!(mgr.tracked_count(), 1);

        mgr.remove(&path).await;
        assert_eq!(mgr.tracked_count(), 0);
        assert!(!path.exists());

        // Removing again is a no-op.
        mgr.remove(&path).await;
    }

    #[tokio::test]
    async fn sweep_skips_tracked_and_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CleanupManager::new(dir.path().to_path_buf());

        let live = mgr.scratch_path(1, 1);
        tokio::fs::write(&live, b"live").await.unwrap();
        let stale = dir.path().join("dl_9_9");
        tokio::fs::write(&stale, b"stale").await.unwrap();
        let fresh = dir.path().join("dl_8_8");
        tokio::fs::write(&fresh, b"fresh").await.unwrap();

        // Zero age threshold sweeps everything untracked.
        let removed = mgr.sweep_stale(Duration::ZERO).await;
        assert_eq!(removed, 2);
        assert!(live.exists());
        assert!(!stale.exists());
        assert!(!fresh.exists());
    }
}
