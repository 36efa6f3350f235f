use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of per-path mutexes guaranteeing at most one in-flight processor
/// invocation per canonical path.
///
/// Slots are created on demand and reference-counted by waiters; the slot for
/// a path is removed as soon as its last guard (or cancelled waiter) drops,
/// so the registry stays bounded by the number of in-flight requests.
#[derive(Clone, Default)]
pub struct PathLocks {
    registry: Arc<Mutex<HashMap<PathBuf, LockSlot>>>,
}

struct LockSlot {
    lock: Arc<AsyncMutex<()>>,
    waiters: usize,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex for `path`, waiting behind any current holder. The
    /// returned guard releases the mutex and drops the waiter reference when
    /// dropped, including on cancellation while still waiting.
    pub async fn acquire(&self, path: &Path) -> PathLockGuard {
        let lease = WaiterLease::register(self.registry.clone(), path.to_path_buf());
        let guard = lease.lock.clone().lock_owned().await;
        PathLockGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of paths currently tracked.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds this task's waiter reference on a lock slot.
struct WaiterLease {
    registry: Arc<Mutex<HashMap<PathBuf, LockSlot>>>,
    path: PathBuf,
    lock: Arc<AsyncMutex<()>>,
}

impl WaiterLease {
    fn register(registry: Arc<Mutex<HashMap<PathBuf, LockSlot>>>, path: PathBuf) -> Self {
        let lock = {
            let mut slots = registry.lock();
            let slot = slots.entry(path.clone()).or_insert_with(|| LockSlot {
                lock: Arc::new(AsyncMutex::new(())),
                waiters: 0,
            });
            slot.waiters += 1;
            slot.lock.clone()
        };
        Self {
            registry,
            path,
            lock,
        }
    }
}

impl Drop for WaiterLease {
    fn drop(&mut self) {
        let mut slots = self.registry.lock();
        if let Some(slot) = slots.get_mut(&self.path) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                slots.remove(&self.path);
            }
        }
    }
}

/// RAII guard over one path's mutex.
pub struct PathLockGuard {
    _guard: OwnedMutexGuard<()>,
    _lease: WaiterLease,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_path() {
        let locks = PathLocks::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _guard = locks.acquire(Path::new("/tmp/shared")).await;
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_paths_run_in_parallel() {
        let locks = PathLocks::new();
        let _a = locks.acquire(Path::new("/tmp/a")).await;
        // Must not deadlock: /tmp/b is an independent slot.
        let _b = locks.acquire(Path::new("/tmp/b")).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn slots_are_collected_when_unused() {
        let locks = PathLocks::new();
        {
            let _guard = locks.acquire(Path::new("/tmp/a")).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_reference() {
        let locks = PathLocks::new();
        let held = locks.acquire(Path::new("/tmp/a")).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(Path::new("/tmp/a")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert!(locks.is_empty());
    }
}
