//! Engine Facade
//!
//! The host-facing API: pool sizing, snapshot activation, checkpoint
//! dispatch, ad-hoc script evaluation and shutdown. Every method is safe to
//! call from any thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::context::{ContextSource, RequestContextCache};
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::error::{EngineError, EngineResult, LoadError, PoolError, ScriptError};
use crate::js::IsolateFactory;
use crate::pool::{IsolatePool, PoolStatus};
use crate::sink::{LogSink, Sinks, StackSource};
use crate::snapshot::{PluginScript, Snapshot, SnapshotBuilder};
use crate::verdict::{Verdict, encode};
use crate::watchdog::{TimerOutcome, Watchdog};

/// A pool of plugin isolates and everything needed to dispatch to them.
pub struct Engine {
    factory: Arc<IsolateFactory>,
    pool: RwLock<Arc<IsolatePool>>,
    contexts: RequestContextCache,
    generation: AtomicU64,
    build_lock: Mutex<()>,
}

impl Engine {
    /// Create an engine with a pool of `config.pool_size` isolates. No
    /// checks are served until a snapshot is created or installed.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        if config.pool_size == 0 {
            return Err(EngineError::InvalidPoolSize);
        }

        let watchdog = Watchdog::spawn(config.interrupt_grace()).map_err(EngineError::Watchdog)?;
        let contexts = RequestContextCache::new(config.context_ttl(), config.context_sweep_interval());
        let capacity = config.pool_size;
        let factory = Arc::new(IsolateFactory::new(
            Arc::new(config),
            Arc::new(Sinks::default()),
            Arc::new(watchdog),
        ));
        let pool = Arc::new(IsolatePool::new(capacity, factory.clone(), None));

        tracing::info!("Engine initialized with {} isolates", capacity);

        Ok(Self {
            factory,
            pool: RwLock::new(pool),
            contexts,
            generation: AtomicU64::new(0),
            build_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.factory.config()
    }

    /// Resize the pool. Calling it again with the current size is a no-op;
    /// calling it after [`Engine::dispose`] brings up a fresh pool.
    ///
    /// In-flight dispatches finish on the previous pool.
    pub fn initialize(&self, pool_size: usize) -> EngineResult<()> {
        if pool_size == 0 {
            return Err(EngineError::InvalidPoolSize);
        }

        let previous = {
            let mut pool = self.pool.write();
            if pool.capacity() == pool_size && !pool.is_closed() {
                return Ok(());
            }
            let replacement = Arc::new(IsolatePool::new(pool_size, self.factory.clone(), pool.active()));
            std::mem::replace(&mut *pool, replacement)
        };
        previous.close();

        tracing::info!("Isolate pool resized to {}", pool_size);
        Ok(())
    }

    /// Replace the logger; `None` restores the default tracing sink.
    pub fn set_logger(&self, logger: Option<Arc<dyn LogSink>>) {
        self.factory.sinks().set_logger(logger);
    }

    pub fn set_stack_source(&self, source: Option<Arc<dyn StackSource>>) {
        self.factory.sinks().set_stack_source(source);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate a plugin bundle and make it active.
    ///
    /// On failure the previously active snapshot stays in place and the
    /// error is also reported to the log sink.
    pub fn create_snapshot(
        &self,
        config: &str,
        scripts: Vec<PluginScript>,
        version: &str,
    ) -> EngineResult<Arc<Snapshot>> {
        let _build = self.build_lock.lock();
        let snapshot = SnapshotBuilder::new(&self.factory)
            .build(config, scripts, version)
            .map_err(|e| self.load_failed(e))?;
        Ok(self.activate(snapshot))
    }

    /// Re-validate a snapshot read with [`Snapshot::load`] and make it active.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> EngineResult<Arc<Snapshot>> {
        let _build = self.build_lock.lock();
        let snapshot = SnapshotBuilder::new(&self.factory)
            .rebuild(snapshot)
            .map_err(|e| self.load_failed(e))?;
        Ok(self.activate(snapshot))
    }

    fn load_failed(&self, error: LoadError) -> EngineError {
        tracing::warn!("Snapshot build failed: {}", error);
        self.factory.sinks().log(&error.to_string());
        error.into()
    }

    fn activate(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(snapshot.with_generation(generation));
        self.pool.read().reload(snapshot.clone());

        tracing::info!(
            "Activated snapshot {} (generation {}, {} scripts)",
            snapshot.version(),
            generation,
            snapshot.scripts().len()
        );
        snapshot
    }

    /// The active snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.pool.read().active()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatch a checkpoint and return the verdicts as a JSON array, or
    /// `None` when there is no verdict.
    ///
    /// `timeout_ms` of 0 or less means no limit. Failures never surface
    /// here; they are logged and reported as "no verdict".
    pub fn check(
        &self,
        checkpoint: &str,
        params: &[u8],
        context: Arc<dyn ContextSource>,
        timeout_ms: i64,
    ) -> Option<Vec<u8>> {
        encode(&self.check_verdicts(checkpoint, params, context, timeout_ms))
    }

    /// [`Engine::check`] without the JSON encoding.
    pub fn check_verdicts(
        &self,
        checkpoint: &str,
        params: &[u8],
        context: Arc<dyn ContextSource>,
        timeout_ms: i64,
    ) -> Vec<Verdict> {
        let sinks = self.factory.sinks();
        if !self.config().is_known_checkpoint(checkpoint) {
            sinks.log(&format!("Unknown check point name '{}'", checkpoint));
            return Vec::new();
        }

        self.contexts.maybe_sweep();

        let params = match std::str::from_utf8(params) {
            Ok(params) => params,
            Err(e) => {
                sinks.log(&format!("Failed to parse parameters of checkpoint {}: {}", checkpoint, e));
                return Vec::new();
            }
        };

        let pool = self.pool.read().clone();
        let mut isolate = match pool.acquire() {
            Ok(isolate) => isolate,
            Err(PoolError::NoSnapshot) | Err(PoolError::Disposed) => {
                tracing::debug!("No isolate available for {}", checkpoint);
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!("Failed to acquire isolate for {}: {}", checkpoint, e);
                sinks.log(&format!("Failed to acquire isolate for checkpoint {}: {}", checkpoint, e));
                return Vec::new();
            }
        };

        let timeout = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Dispatcher::new(&self.factory, &self.contexts).dispatch(
            &mut isolate,
            DispatchRequest {
                checkpoint,
                params,
                context,
                timeout,
            },
        )
    }

    /// Evaluate `source` in a scratch isolate running the active plugins,
    /// outside the checkpoint protocol. Script errors are returned.
    pub fn execute_script(&self, source: &str, filename: &str) -> Result<String, ScriptError> {
        let pool = self.pool.read().clone();
        if pool.is_closed() {
            return Err(PoolError::Disposed.into());
        }
        let isolate = match pool.active() {
            Some(snapshot) => self.factory.seed(&snapshot),
            None => self.factory.bare(),
        }
        .map_err(PoolError::Seed)?;

        let config = self.config();
        let (result, outcome) = isolate.evaluate(source, self.factory.watchdog(), config.script_timeout());
        match result {
            Ok(value) => Ok(value),
            Err(_) if outcome != TimerOutcome::Completed => Err(ScriptError::Timeout(config.script_timeout_ms)),
            Err(failure) => Err(ScriptError::Exception(format!("{}: {}", filename, failure.message()))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> PoolStatus {
        self.pool.read().status()
    }

    /// Drop request context state idle for longer than the configured TTL.
    pub fn sweep_contexts(&self) -> usize {
        self.contexts.sweep()
    }

    /// Number of logical requests with carried-over context state.
    pub fn cached_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Stop serving checks, wait for in-flight dispatches and tear down every
    /// isolate. The active snapshot is released.
    pub fn dispose(&self) {
        let pool = self.pool.read().clone();
        pool.drain();
        self.contexts.clear();
        tracing::info!("Engine disposed");
    }
}
