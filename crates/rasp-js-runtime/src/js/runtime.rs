//! QuickJS Isolate
//!
//! One QuickJS runtime and context with the plugin prelude installed. An
//! isolate is only ever driven by one thread at a time; the pool hands it
//! between threads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rquickjs::context::EvalOptions;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Object, Runtime, Value};

use super::globals::{Bridge, register_native_bindings};
use crate::config::EngineConfig;
use crate::context::ContextView;
use crate::error::LoadError;
use crate::sink::Sinks;
use crate::snapshot::{PluginScript, Snapshot};
use crate::watchdog::{ArmedTimer, InterruptHandle, TimerOutcome, Watchdog};

const PRELUDE: &str = include_str!("prelude.js");

// ─────────────────────────────────────────────────────────────────────────────
// Script Failure
// ─────────────────────────────────────────────────────────────────────────────

/// A failure raised by script code rather than by a plugin handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScriptFailure {
    /// The checkpoint parameters were not valid JSON.
    Params(String),
    /// Script code threw, or was interrupted.
    Exception(String),
    /// The isolate hit its heap limit.
    OutOfMemory(String),
}

impl ScriptFailure {
    pub(crate) fn message(&self) -> &str {
        match self {
            ScriptFailure::Params(m) | ScriptFailure::Exception(m) | ScriptFailure::OutOfMemory(m) => m,
        }
    }
}

/// Run `result` through QuickJS exception capture and render the error.
fn caught<'js, T>(ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> Result<T, String> {
    result.catch(ctx).map_err(|e| e.to_string())
}

/// Like [`caught`], but tells the engine running out of heap apart from
/// ordinary exceptions.
fn classified<'js, T>(ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> Result<T, ScriptFailure> {
    result.catch(ctx).map_err(|error| {
        let message = error.to_string();
        if is_heap_exhaustion(ctx, &error) {
            ScriptFailure::OutOfMemory(message)
        } else {
            ScriptFailure::Exception(message)
        }
    })
}

/// The engine raises a real `InternalError` with this exact message when an
/// allocation fails. Errors scripts build through the `InternalError`
/// constructor are remembered by the prelude and rejected here.
fn is_heap_exhaustion<'js>(ctx: &Ctx<'js>, error: &CaughtError<'js>) -> bool {
    match error {
        CaughtError::Error(rquickjs::Error::Allocation) => true,
        CaughtError::Exception(exception) => {
            let looks_exhausted = exception.message().as_deref() == Some("out of memory")
                && exception
                    .as_object()
                    .get::<_, String>("name")
                    .is_ok_and(|name| name == "InternalError");
            if !looks_exhausted {
                return false;
            }
            // The check itself may not get the memory it needs; the shape
            // alone decides then.
            api_function(ctx, "isOutOfMemory")
                .ok()
                .and_then(|check| check.call::<_, bool>((exception.as_object().clone(),)).ok())
                .unwrap_or(true)
        }
        _ => false,
    }
}

fn evaluate_source<'js>(ctx: &Ctx<'js>, source: &str) -> rquickjs::Result<Value<'js>> {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = false;
    options.backtrace_barrier = true;

    ctx.eval_with_options(source, options)
}


/// The frozen internal API object the prelude defines.
fn internal_api<'js>(ctx: &Ctx<'js>) -> Result<Object<'js>, String> {
    caught(ctx, ctx.globals().get("__rasp"))
}

fn api_function<'js>(ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>, String> {
    let api = internal_api(ctx)?;
    caught(ctx, api.get(name))
}

// ─────────────────────────────────────────────────────────────────────────────
// Isolate
// ─────────────────────────────────────────────────────────────────────────────

/// A prelude-seeded QuickJS execution context.
pub(crate) struct Isolate {
    id: u64,
    generation: u64,
    interrupt: Arc<InterruptHandle>,
    bridge: Arc<Bridge>,
    context: Context,
    runtime: Runtime,
}

impl Isolate {
    fn create(id: u64, config: &EngineConfig, sinks: Arc<Sinks>) -> Result<Self, LoadError> {
        let runtime = Runtime::new().map_err(|e| LoadError::Engine(e.to_string()))?;
        if config.memory_limit > 0 {
            runtime.set_memory_limit(config.memory_limit);
        }
        runtime.set_max_stack_size(config.max_stack_size);

        let interrupt = Arc::new(InterruptHandle::default());
        let requested = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || requested.is_requested())));

        let context = Context::full(&runtime).map_err(|e| LoadError::Engine(e.to_string()))?;

        let bridge = Arc::new(Bridge::new(sinks));
        let settings = serde_json::json!({
            "checkpoints": config.checkpoints,
            "schema": config.context,
        })
        .to_string();

        context.with(|ctx| -> Result<(), LoadError> {
            register_native_bindings(&ctx, &bridge, &settings)
                .map_err(|e| LoadError::Engine(e.to_string()))?;
            caught(&ctx, evaluate_source(&ctx, PRELUDE))
                .map(|_| ())
                .map_err(|e| LoadError::Engine(format!("prelude: {}", e)))
        })?;

        tracing::debug!("Created isolate {}", id);

        Ok(Self {
            id,
            generation: 0,
            interrupt,
            bridge,
            context,
            runtime,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Generation of the snapshot this isolate was seeded from.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Run `work` against this isolate, bounded by `timeout` when given.
    fn bounded<R>(
        &self,
        watchdog: &Watchdog,
        timeout: Option<Duration>,
        work: impl FnOnce(&Self) -> R,
    ) -> (R, TimerOutcome) {
        self.interrupt.begin();
        let timer = timeout.map(|t| watchdog.arm(t, &self.interrupt));
        let result = work(self);
        let outcome = timer
            .map(ArmedTimer::finish)
            .unwrap_or(TimerOutcome::Completed);
        (result, outcome)
    }

    /// Set `config` and `version`, then run every plugin script in order.
    pub(crate) fn load(
        &self,
        config: &str,
        version: &str,
        scripts: &[PluginScript],
        watchdog: &Watchdog,
        timeout: Option<Duration>,
    ) -> Result<(), LoadError> {
        self.context
            .with(|ctx| -> Result<(), String> {
                let configure = api_function(&ctx, "configure")?;
                caught(&ctx, configure.call::<_, Value>((config, version))).map(|_| ())
            })
            .map_err(LoadError::Config)?;

        for script in scripts {
            let wrapped = format!("(function(){{\n{}\n}})()", script.source);
            let (result, outcome) = self.bounded(watchdog, timeout, |isolate| {
                isolate
                    .context
                    .with(|ctx| classified(&ctx, evaluate_source(&ctx, &wrapped)).map(|_| ()))
                    .and_then(|_| isolate.drain_jobs())
            });

            if let Err(failure) = result {
                if outcome != TimerOutcome::Completed {
                    return Err(LoadError::Timeout {
                        name: script.name.clone(),
                    });
                }
                return Err(LoadError::Script {
                    name: script.name.clone(),
                    message: failure.message().to_string(),
                });
            }
            tracing::debug!("Isolate {} loaded {}", self.id, script.name);
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Run all handlers for `checkpoint` and collect their raw outcomes as
    /// JSON. `state` is the request state carried over from an earlier
    /// checkpoint.
    pub(crate) fn dispatch(
        &self,
        view: ContextView,
        checkpoint: &str,
        params: &str,
        state: Option<&str>,
        watchdog: &Watchdog,
        timeout: Option<Duration>,
    ) -> (Result<String, ScriptFailure>, TimerOutcome) {
        self.bridge.attach(view);
        let outcome = self.bounded(watchdog, timeout, |isolate| {
            isolate.invoke(checkpoint, params, state)?;
            isolate.drain_jobs()?;
            isolate.collect()
        });
        self.bridge.detach();
        outcome
    }

    fn invoke(&self, checkpoint: &str, params: &str, state: Option<&str>) -> Result<(), ScriptFailure> {
        self.context.with(|ctx| {
            let parse = api_function(&ctx, "parseParams").map_err(ScriptFailure::Exception)?;
            let params: Value = caught(&ctx, parse.call((params,))).map_err(ScriptFailure::Params)?;

            let check = api_function(&ctx, "check").map_err(ScriptFailure::Exception)?;
            classified(&ctx, check.call::<_, Value>((checkpoint, params, state))).map(|_| ())
        })
    }

    /// Run queued promise jobs so async handlers can settle.
    fn drain_jobs(&self) -> Result<(), ScriptFailure> {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(_) => {
                    let failure = self.context.with(|ctx| {
                        classified(&ctx, Err::<(), _>(rquickjs::Error::Exception))
                            .err()
                            .unwrap_or_else(|| ScriptFailure::Exception(String::new()))
                    });
                    return Err(failure);
                }
            }
        }
    }

    fn collect(&self) -> Result<String, ScriptFailure> {
        self.context.with(|ctx| {
            let collect = api_function(&ctx, "collect").map_err(ScriptFailure::Exception)?;
            classified(&ctx, collect.call::<_, String>(()))
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Evaluate free-standing source and render its completion value.
    pub(crate) fn evaluate(
        &self,
        source: &str,
        watchdog: &Watchdog,
        timeout: Option<Duration>,
    ) -> (Result<String, ScriptFailure>, TimerOutcome) {
        self.bounded(watchdog, timeout, |isolate| {
            isolate.context.with(|ctx| {
                let value = classified(&ctx, evaluate_source(&ctx, source))?;
                let inspect = api_function(&ctx, "inspect").map_err(ScriptFailure::Exception)?;
                classified(&ctx, inspect.call::<_, String>((value,)))
            })
        })
    }

    /// Checkpoint name to the plugins registered on it, in order.
    pub(crate) fn registry(&self) -> Result<BTreeMap<String, Vec<String>>, String> {
        let summary = self.context.with(|ctx| {
            let summary = api_function(&ctx, "summary")?;
            caught(&ctx, summary.call::<_, String>(()))
        })?;
        serde_json::from_str(&summary).map_err(|e| e.to_string())
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        tracing::debug!("Destroying isolate {} (generation {})", self.id, self.generation);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Isolate Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Creates isolates that share the engine's configuration, collaborators and
/// watchdog.
pub(crate) struct IsolateFactory {
    config: Arc<EngineConfig>,
    sinks: Arc<Sinks>,
    watchdog: Arc<Watchdog>,
    next_id: AtomicU64,
}

impl IsolateFactory {
    pub(crate) fn new(config: Arc<EngineConfig>, sinks: Arc<Sinks>, watchdog: Arc<Watchdog>) -> Self {
        Self {
            config,
            sinks,
            watchdog,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn sinks(&self) -> &Sinks {
        &self.sinks
    }

    pub(crate) fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// An isolate with only the prelude installed.
    pub(crate) fn bare(&self) -> Result<Isolate, LoadError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Isolate::create(id, &self.config, self.sinks.clone())
    }

    /// Load `scripts` into a fresh isolate.
    pub(crate) fn load(&self, config: &str, version: &str, scripts: &[PluginScript]) -> Result<Isolate, LoadError> {
        let isolate = self.bare()?;
        isolate.load(config, version, scripts, &self.watchdog, self.config.load_timeout())?;
        Ok(isolate)
    }

    /// A fresh isolate running `snapshot`'s plugins.
    pub(crate) fn seed(&self, snapshot: &Snapshot) -> Result<Isolate, LoadError> {
        let mut isolate = self.load(&snapshot.config().to_string(), snapshot.version(), snapshot.scripts())?;
        isolate.generation = snapshot.generation();
        Ok(isolate)
    }
}
