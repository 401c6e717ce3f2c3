//! Isolate Pool
//!
//! A bounded set of isolates seeded from the active snapshot. Isolates are
//! created lazily up to capacity, handed out exclusively, and discarded when
//! they fault or their snapshot has been replaced.

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use crate::error::PoolError;
use crate::js::{Isolate, IsolateFactory};
use crate::snapshot::Snapshot;

/// Pool occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Isolates alive, idle or checked out.
    pub live: usize,
    pub idle: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    /// Generation of the active snapshot, 0 when none is active.
    pub generation: u64,
    pub snapshot_version: Option<String>,
}

struct PoolState {
    idle: Vec<Isolate>,
    live: usize,
    waiting: usize,
    closed: bool,
}

/// Where an acquired isolate comes from.
enum Slot {
    Idle(Isolate),
    /// Capacity reserved for a new isolate seeded outside the lock.
    Reserved,
}

pub(crate) struct IsolatePool {
    capacity: usize,
    max_waiters: usize,
    acquire_timeout: Duration,
    factory: Arc<IsolateFactory>,
    active: RwLock<Option<Arc<Snapshot>>>,
    state: Mutex<PoolState>,
    available: Condvar,
    drained: Condvar,
}

impl IsolatePool {
    pub(crate) fn new(capacity: usize, factory: Arc<IsolateFactory>, snapshot: Option<Arc<Snapshot>>) -> Self {
        let config = factory.config();
        Self {
            capacity,
            max_waiters: config.max_waiters,
            acquire_timeout: config.acquire_timeout(),
            active: RwLock::new(snapshot),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                live: 0,
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
            factory,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn active(&self) -> Option<Arc<Snapshot>> {
        self.active.read().clone()
    }

    fn active_generation(&self) -> Option<u64> {
        self.active.read().as_ref().map(|s| s.generation())
    }

    /// Check out an isolate seeded from the active snapshot.
    ///
    /// Blocks up to the acquire timeout when every isolate is in use; fails
    /// fast with [`PoolError::Busy`] when the wait queue is full.
    pub(crate) fn acquire(self: &Arc<Self>) -> Result<IsolateGuard, PoolError> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut retired = Vec::new();

        let slot = {
            let mut state = self.state.lock();
            loop {
                if state.closed {
                    break Err(PoolError::Disposed);
                }
                let Some(generation) = self.active_generation() else {
                    break Err(PoolError::NoSnapshot);
                };

                if let Some(isolate) = state.idle.pop() {
                    if isolate.generation() == generation {
                        break Ok(Slot::Idle(isolate));
                    }
                    state.live -= 1;
                    retired.push(isolate);
                    continue;
                }

                if state.live < self.capacity {
                    state.live += 1;
                    break Ok(Slot::Reserved);
                }

                if state.waiting >= self.max_waiters {
                    break Err(PoolError::Busy);
                }

                state.waiting += 1;
                let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
                state.waiting -= 1;
                if timed_out {
                    break Err(PoolError::Busy);
                }
            }
        };
        drop(retired);

        let isolate = match slot? {
            Slot::Idle(isolate) => isolate,
            Slot::Reserved => match self.seed() {
                Ok(isolate) => isolate,
                Err(e) => {
                    self.forfeit();
                    return Err(e);
                }
            },
        };

        Ok(IsolateGuard {
            pool: self.clone(),
            isolate: Some(isolate),
            healthy: true,
        })
    }

    fn seed(&self) -> Result<Isolate, PoolError> {
        let snapshot = self.active().ok_or(PoolError::NoSnapshot)?;
        self.factory.seed(&snapshot).map_err(PoolError::Seed)
    }

    /// Give back capacity reserved for an isolate that was never created.
    fn forfeit(&self) {
        let mut state = self.state.lock();
        state.live -= 1;
        self.available.notify_one();
        self.drained.notify_all();
    }

    fn release(&self, isolate: Isolate, healthy: bool) {
        let current = self.active_generation();
        let retired = {
            let mut state = self.state.lock();
            let keep = healthy && !state.closed && Some(isolate.generation()) == current;
            let retired = if keep {
                state.idle.push(isolate);
                None
            } else {
                state.live -= 1;
                Some(isolate)
            };
            self.available.notify_one();
            if state.closed {
                self.drained.notify_all();
            }
            retired
        };

        if let Some(isolate) = retired {
            if !healthy {
                tracing::warn!("Discarding faulted isolate {}", isolate.id());
            }
        }
    }

    /// Activate `snapshot`. Idle isolates from older snapshots are dropped
    /// now; checked-out ones finish their dispatch and are dropped on release.
    pub(crate) fn reload(&self, snapshot: Arc<Snapshot>) {
        let generation = snapshot.generation();
        *self.active.write() = Some(snapshot);

        let stale: Vec<Isolate> = {
            let mut state = self.state.lock();
            let (stale, current): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|isolate| isolate.generation() != generation);
            state.idle = current;
            state.live -= stale.len();
            self.available.notify_all();
            stale
        };

        tracing::debug!("Retired {} idle isolates after reload", stale.len());
    }

    /// Stop handing out isolates and drop the idle ones. Checked-out
    /// isolates are dropped as they come back.
    pub(crate) fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            self.available.notify_all();
            idle
        };
        drop(idle);
    }

    /// Close the pool and wait until every checked-out isolate is back.
    pub(crate) fn drain(&self) {
        self.close();
        let mut state = self.state.lock();
        while state.live > 0 {
            self.drained.wait(&mut state);
        }
        drop(state);
        *self.active.write() = None;
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let active = self.active();
        let state = self.state.lock();
        PoolStatus {
            capacity: self.capacity,
            live: state.live,
            idle: state.idle.len(),
            waiting: state.waiting,
            generation: active.as_ref().map(|s| s.generation()).unwrap_or(0),
            snapshot_version: active.map(|s| s.version().to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Isolate Guard
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive use of one isolate; returns it to the pool on drop.
pub(crate) struct IsolateGuard {
    pool: Arc<IsolatePool>,
    isolate: Option<Isolate>,
    healthy: bool,
}

impl IsolateGuard {
    /// Discard the isolate instead of returning it to the pool.
    pub(crate) fn fault(&mut self) {
        self.healthy = false;
    }
}

impl Deref for IsolateGuard {
    type Target = Isolate;

    fn deref(&self) -> &Isolate {
        // Only taken in Drop.
        match &self.isolate {
            Some(isolate) => isolate,
            None => unreachable!("isolate guard used after release"),
        }
    }
}

impl Drop for IsolateGuard {
    fn drop(&mut self) {
        if let Some(isolate) = self.isolate.take() {
            self.pool.release(isolate, self.healthy);
        }
    }
}
