//! Per-key debounce timers.
//!
//! Scheduling a task for a key cancels whatever was pending for that key, so
//! only the last task of a burst runs, one window after it was scheduled.
//! Entries leave the map when their timer fires or is superseded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct PendingTimer {
    generation: u64,
    cancel: CancellationToken,
}

type PendingMap = HashMap<String, PendingTimer>;

pub struct DebounceScheduler {
    window: Duration,
    pending: Arc<Mutex<PendingMap>>,
    generation: AtomicU64,
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    // The map stays consistent even if a holder panicked.
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DebounceScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Keys with a timer still waiting.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// Run `task` for `key` after the window unless another task for the
    /// same key is scheduled first. Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: &str, task: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();

        if let Some(previous) = lock(&self.pending).insert(
            key.to_string(),
            PendingTimer {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            debug!(key, "Debounce timer superseded");
            previous.cancel.cancel();
        }

        let pending = Arc::clone(&self.pending);
        let window = self.window;
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }

            {
                let mut map = lock(&pending);
                match map.get(&key) {
                    Some(timer) if timer.generation == generation => {
                        map.remove(&key);
                    }
                    // Superseded between the timer firing and taking the lock.
                    _ => return,
                }
            }

            debug!(key = %key, "Debounce timer fired");
            task().await;
        })
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        for (_, timer) in lock(&self.pending).drain() {
            timer.cancel.cancel();
        }
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
