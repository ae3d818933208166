//! Keyed mutual exclusion with timeout-based forced release.
//!
//! Used by the download path to collapse concurrent fetches of the same URL
//! into one request. A holder that never releases is force-released after its
//! timeout so waiters are never blocked unboundedly. Waiters retry rather than
//! queue, so grant order across waiters is not FIFO.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Entry {
    id: u64,
    // Dropping the sender (on release or expiry) wakes every waiter.
    released_tx: watch::Sender<()>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    entries: HashMap<String, Entry>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct KeyedLock {
    inner: Arc<Mutex<Shared>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for any current holder to release
    /// or for its timeout to force-release it. The returned guard releases on
    /// drop; `timeout` bounds how long this acquisition may be held.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> LockGuard {
        loop {
            let mut wait_rx = {
                let mut shared = self.inner.lock().expect("lock map poisoned");
                match shared.entries.get(key) {
                    Some(existing) => {
                        log::debug!("lock: waiting on '{}' (holder {})", key, existing.id);
                        // Subscribe while holding the map lock so a release
                        // between here and the await is still observed.
                        existing.released_tx.subscribe()
                    }
                    None => {
                        let id = shared.next_id;
                        shared.next_id += 1;
                        let (released_tx, _) = watch::channel(());
                        let timer = tokio::spawn(expire(
                            Arc::clone(&self.inner),
                            key.to_string(),
                            id,
                            timeout,
                        ));
                        shared.entries.insert(
                            key.to_string(),
                            Entry {
                                id,
                                released_tx,
                                timer,
                            },
                        );
                        log::debug!("lock: acquired '{}' ({})", key, id);
                        return LockGuard {
                            inner: Arc::clone(&self.inner),
                            key: key.to_string(),
                            id,
                            released: false,
                        };
                    }
                }
            };

            // Err means the sender was dropped, i.e. the entry was released
            // or expired. Either way, retry acquisition.
            let _ = wait_rx.changed().await;
        }
    }
}

/// Force-release a held lock once its timeout elapses. The original holder is
/// not notified; its later release becomes a no-op via the id check.
async fn expire(inner: Arc<Mutex<Shared>>, key: String, id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Ok(mut shared) = inner.lock() {
        if shared.entries.get(&key).map(|e| e.id) == Some(id) {
            log::warn!("lock: '{}' ({}) timed out, force-releasing", key, id);
            shared.entries.remove(&key);
        }
    }
}

pub struct LockGuard {
    inner: Arc<Mutex<Shared>>,
    key: String,
    id: u64,
    released: bool,
}

impl LockGuard {
    /// Explicit release; equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(mut shared) = self.inner.lock() {
            if shared.entries.get(&self.key).map(|e| e.id) == Some(self.id) {
                let entry = shared.entries.remove(&self.key).unwrap();
                entry.timer.abort();
                log::debug!("lock: released '{}' ({})", self.key, self.id);
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
