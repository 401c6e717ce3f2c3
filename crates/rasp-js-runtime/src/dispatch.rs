//! Checkpoint Dispatch
//!
//! Runs one checkpoint on a checked-out isolate: restores the request's
//! carried-over context state, invokes the handlers under the watchdog and
//! turns their raw outcomes into verdicts.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::context::{ContextSource, ContextView, RequestContextCache};
use crate::js::{IsolateFactory, ScriptFailure};
use crate::pool::IsolateGuard;
use crate::verdict::{Verdict, normalize};
use crate::watchdog::TimerOutcome;

/// What the prelude reports after running a checkpoint's handlers.
#[derive(Debug, Deserialize)]
struct Collected {
    #[serde(default)]
    entries: Vec<HandlerOutcome>,
    /// JSON of the script-written context fields, if any.
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HandlerOutcome {
    plugin: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    /// Set by the prelude only for errors the engine raised on heap exhaustion.
    #[serde(default, rename = "outOfMemory")]
    out_of_memory: bool,
}

/// One checkpoint call.
pub(crate) struct DispatchRequest<'a> {
    pub checkpoint: &'a str,
    pub params: &'a str,
    pub context: Arc<dyn ContextSource>,
    pub timeout: Option<Duration>,
}

pub(crate) struct Dispatcher<'a> {
    factory: &'a IsolateFactory,
    contexts: &'a RequestContextCache,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(factory: &'a IsolateFactory, contexts: &'a RequestContextCache) -> Self {
        Self { factory, contexts }
    }

    fn log(&self, message: &str) {
        self.factory.sinks().log(message);
    }

    pub(crate) fn dispatch(&self, isolate: &mut IsolateGuard, request: DispatchRequest<'_>) -> Vec<Verdict> {
        let config = self.factory.config();
        let checkpoint = request.checkpoint;
        let terminal = config.is_terminal_checkpoint(checkpoint);

        let run = catch_unwind(AssertUnwindSafe(|| {
            let request_id = request.context.request_id();
            let state = request_id.as_deref().and_then(|id| self.contexts.load(id));
            let (result, outcome) = isolate.dispatch(
                ContextView::new(request.context.clone()),
                checkpoint,
                request.params,
                state.as_deref(),
                self.factory.watchdog(),
                request.timeout,
            );
            (request_id, state.is_some(), result, outcome)
        }));

        let (request_id, had_state, result, outcome) = match run {
            Ok(run) => run,
            Err(_) => {
                tracing::error!("Dispatch of {} panicked, discarding isolate {}", checkpoint, isolate.id());
                isolate.fault();
                return Vec::new();
            }
        };

        if terminal {
            if let Some(id) = &request_id {
                self.contexts.purge(id);
            }
        }

        if outcome == TimerOutcome::Faulted {
            isolate.fault();
        }

        // Once the deadline fired, nothing the handlers produced counts.
        if outcome != TimerOutcome::Completed {
            if let Err(failure) = &result {
                tracing::debug!("Interrupted dispatch of {} ended with: {}", checkpoint, failure.message());
            }
            tracing::warn!("Checkpoint {} timed out", checkpoint);
            self.log(&format!("Javascript plugin execution timeout on checkpoint {}", checkpoint));
            return vec![Verdict::timeout(config.timeout_action)];
        }

        match result {
            Ok(collected) => {
                let collected = match serde_json::from_str::<Collected>(&collected) {
                    Ok(collected) => collected,
                    Err(e) => {
                        tracing::error!("Malformed dispatch result for {}: {}", checkpoint, e);
                        return Vec::new();
                    }
                };
                if let (Some(id), false) = (&request_id, terminal) {
                    match collected.state {
                        Some(ref state) => self.contexts.store(id, state.clone()),
                        None if had_state => self.contexts.purge(id),
                        None => {}
                    }
                }
                match self.verdicts(checkpoint, collected) {
                    Ok(verdicts) => verdicts,
                    Err(plugin) => {
                        tracing::error!("Plugin {} exhausted the heap of isolate {}", plugin, isolate.id());
                        self.log(&format!("[{}] Javascript plugin out of memory on checkpoint {}", plugin, checkpoint));
                        isolate.fault();
                        vec![Verdict::out_of_memory()]
                    }
                }
            }
            Err(ScriptFailure::OutOfMemory(message)) => {
                tracing::error!("Isolate {} ran out of memory: {}", isolate.id(), message);
                self.log(&format!("Javascript plugin out of memory on checkpoint {}", checkpoint));
                isolate.fault();
                vec![Verdict::out_of_memory()]
            }
            Err(ScriptFailure::Params(message)) => {
                self.log(&format!("Failed to parse parameters of checkpoint {}: {}", checkpoint, message));
                Vec::new()
            }
            Err(ScriptFailure::Exception(message)) => {
                tracing::error!("Dispatch of {} failed: {}", checkpoint, message);
                self.log(&format!("Failed to dispatch checkpoint {}: {}", checkpoint, message));
                Vec::new()
            }
        }
    }

    /// Normalize handler outcomes in registration order. A handler that ran
    /// the heap out fails the whole dispatch with its plugin name.
    fn verdicts(&self, checkpoint: &str, collected: Collected) -> Result<Vec<Verdict>, String> {
        let mut verdicts = Vec::new();
        for entry in collected.entries {
            if entry.out_of_memory {
                return Err(entry.plugin);
            }
            if let Some(error) = entry.error {
                tracing::warn!("Plugin {} failed on {}: {}", entry.plugin, checkpoint, error);
                self.log(&format!("[{}] {}", entry.plugin, error));
                continue;
            }
            let Some(result) = entry.result else {
                continue;
            };
            match normalize(&entry.plugin, result) {
                Ok(Some(verdict)) => verdicts.push(verdict),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Plugin {} returned a malformed verdict on {}: {}", entry.plugin, checkpoint, e);
                    self.log(&format!("[{}] {}", entry.plugin, e));
                }
            }
        }
        Ok(verdicts)
    }
}
