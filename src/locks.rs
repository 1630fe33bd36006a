//! Write lock registry: at most one in-flight write per path.
//!
//! Writers take the lock with [`WriteLockRegistry::acquire`], which fails
//! fast instead of queueing a second writer. Readers and deleters call
//! [`WriteLockRegistry::wait_if_locked`], which blocks until any in-flight
//! write on the same path releases, without taking a lock themselves, so
//! multiple readers proceed concurrently once the writer is gone.
//!
//! The table mutex is held only around entry insertion/removal; blocking
//! waits happen on a `watch` channel whose sender drop wakes every waiter
//! exactly once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Process-wide table of in-flight writes, keyed by resolved absolute path.
#[derive(Debug, Default)]
pub struct WriteLockRegistry {
    table: Mutex<HashMap<PathBuf, watch::Sender<()>>>,
}

/// RAII guard for one in-flight write.
///
/// Dropping the guard removes the table entry and wakes all waiters.
#[derive(Debug)]
pub struct WriteGuard {
    registry: Arc<WriteLockRegistry>,
    path: PathBuf,
}

impl WriteLockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to mark a write as in flight for `path`.
    ///
    /// Returns `None` if a write is already in flight — the caller must
    /// report a conflict, not wait.
    pub fn acquire(self: &Arc<Self>, path: PathBuf) -> Option<WriteGuard> {
        let mut table = self.table.lock().expect("lock table poisoned");
        if table.contains_key(&path) {
            return None;
        }
        let (tx, _rx) = watch::channel(());
        table.insert(path.clone(), tx);
        Some(WriteGuard {
            registry: Arc::clone(self),
            path,
        })
    }

    /// Block until no write is in flight for `path`.
    ///
    /// Returns immediately if the path is unlocked. The table mutex is
    /// released before waiting.
    pub async fn wait_if_locked(&self, path: &Path) {
        loop {
            let rx = {
                let table = self.table.lock().expect("lock table poisoned");
                table.get(path).map(watch::Sender::subscribe)
            };
            let Some(mut rx) = rx else {
                return;
            };
            // Waits until the writer's sender is dropped.
            while rx.changed().await.is_ok() {}
        }
    }

    /// Whether a write is currently in flight for `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.table
            .lock()
            .expect("lock table poisoned")
            .contains_key(path)
    }

    fn release(&self, path: &Path) {
        let mut table = self.table.lock().expect("lock table poisoned");
        // Dropping the sender closes the channel and wakes every waiter.
        table.remove(path);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_is_exclusive_per_path() {
        let registry = Arc::new(WriteLockRegistry::new());
        let guard = registry.acquire(PathBuf::from("/a/b")).unwrap();
        assert!(registry.acquire(PathBuf::from("/a/b")).is_none());
        // A different path is independent.
        assert!(registry.acquire(PathBuf::from("/a/c")).is_some());
        drop(guard);
        assert!(registry.acquire(PathBuf::from("/a/b")).is_some());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_unlocked() {
        let registry = Arc::new(WriteLockRegistry::new());
        tokio::time::timeout(
            Duration::from_millis(100),
            registry.wait_if_locked(Path::new("/nope")),
        )
        .await
        .expect("wait_if_locked should not block on an unlocked path");
    }

    #[tokio::test]
    async fn test_release_wakes_all_waiters() {
        let registry = Arc::new(WriteLockRegistry::new());
        let guard = registry.acquire(PathBuf::from("/x")).unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            waiters.push(tokio::spawn(async move {
                registry.wait_if_locked(Path::new("/x")).await;
            }));
        }

        // Give the waiters a chance to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for waiter in &waiters {
            assert!(!waiter.is_finished());
        }

        drop(guard);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should wake after release")
                .unwrap();
        }
        assert!(!registry.is_locked(Path::new("/x")));
    }

    #[tokio::test]
    async fn test_guard_released_on_drop_in_error_path() {
        let registry = Arc::new(WriteLockRegistry::new());
        {
            let _guard = registry.acquire(PathBuf::from("/err")).unwrap();
            // Simulated early return with the guard in scope.
        }
        assert!(!registry.is_locked(Path::new("/err")));
    }
}
