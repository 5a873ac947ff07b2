use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    by_id: HashMap<String, Timer>,
}

/// One single-shot expiry timer per sandbox id.
///
/// Starting a timer for an id that already has one aborts the old task
/// first, so the deadline is always measured from the latest call.
#[derive(Clone, Default)]
pub struct TtlRegistry {
    timers: Arc<Mutex<Timers>>,
}

impl TtlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any timer for `sandbox_id` with one firing after `ttl`.
    pub fn start<F>(&self, sandbox_id: &str, ttl: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = lock(&self.timers);
        if let Some(old) = timers.by_id.remove(sandbox_id) {
            old.handle.abort();
        }

        timers.next_generation += 1;
        let generation = timers.next_generation;
        let registry = Arc::clone(&self.timers);
        let id = sandbox_id.to_string();
        let deadline = tokio::time::Instant::now() + ttl;

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Deregister before running the callback: the kill path calls
            // `clear` for this id and must not abort the task running it.
            {
                let mut timers = lock(&registry);
                match timers.by_id.get(&id) {
                    Some(t) if t.generation == generation => {
                        timers.by_id.remove(&id);
                    }
                    _ => return,
                }
            }
            tracing::info!(sandbox_id = %id, ttl_secs = ttl.as_secs(), "sandbox TTL expired");
            on_expire.await;
        });

        timers
            .by_id
            .insert(sandbox_id.to_string(), Timer { generation, handle });
        tracing::debug!(sandbox_id = %sandbox_id, ttl_secs = ttl.as_secs(), "TTL armed");
    }

    /// Same as `start`: full replacement, never extends a prior deadline.
    pub fn update<F>(&self, sandbox_id: &str, ttl: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.start(sandbox_id, ttl, on_expire);
    }

    pub fn clear(&self, sandbox_id: &str) {
        if let Some(timer) = lock(&self.timers).by_id.remove(sandbox_id) {
            timer.handle.abort();
            tracing::debug!(sandbox_id = %sandbox_id, "TTL cleared");
        }
    }

    pub fn clear_all(&self) {
        let mut timers = lock(&self.timers);
        let count = timers.by_id.len();
        for (_, timer) in timers.by_id.drain() {
            timer.handle.abort();
        }
        if count > 0 {
            tracing::info!(count, "cleared all TTL timers");
        }
    }

    pub fn contains(&self, sandbox_id: &str) -> bool {
        lock(&self.timers).by_id.contains_key(sandbox_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.timers).by_id.len()
    }
}

fn lock(timers: &Mutex<Timers>) -> std::sync::MutexGuard<'_, Timers> {
    // The map holds no invariants a panicking holder could break.
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
