//! Request Context Cache
//!
//! Carries script-written context fields from one checkpoint of a logical
//! request to the next, across isolates and threads.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

struct CachedState {
    /// JSON object of the fields scripts added to the context.
    state: String,
    touched: Instant,
}

/// Request identity to accumulated context state.
///
/// Entries expire after `ttl` without a touch, so requests whose terminal
/// checkpoint never arrives do not accumulate.
pub struct RequestContextCache {
    entries: DashMap<String, CachedState>,
    ttl: Duration,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl RequestContextCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// State stored for `request_id`, refreshing its inactivity clock.
    pub fn load(&self, request_id: &str) -> Option<String> {
        let mut entry = self.entries.get_mut(request_id)?;
        if entry.touched.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(request_id);
            return None;
        }
        entry.touched = Instant::now();
        Some(entry.state.clone())
    }

    pub fn store(&self, request_id: &str, state: String) {
        self.entries.insert(
            request_id.to_string(),
            CachedState {
                state,
                touched: Instant::now(),
            },
        );
    }

    pub fn purge(&self, request_id: &str) {
        self.entries.remove(request_id);
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        *self.last_sweep.lock() = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.touched.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::warn!("Evicted {} inactive request contexts", removed);
        }
        removed
    }

    /// Sweep if the last sweep is older than the sweep interval.
    ///
    /// Concurrent callers skip rather than wait.
    pub fn maybe_sweep(&self) -> usize {
        {
            let Some(last) = self.last_sweep.try_lock() else {
                return 0;
            };
            if last.elapsed() < self.sweep_interval {
                return 0;
            }
        }
        self.sweep()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
