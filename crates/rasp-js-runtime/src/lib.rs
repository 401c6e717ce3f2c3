//! RASP JavaScript Runtime
//!
//! Execution core of a runtime application self-protection sandbox. Plugins
//! written in JavaScript register handlers on named checkpoints (`request`,
//! `sql`, `command`, ...); the host dispatches each checkpoint with JSON
//! parameters and a lazily read request context, and gets back the verdicts
//! the handlers returned.
//!
//! # Architecture
//!
//! - Plugins run in QuickJS isolates held in a bounded pool
//! - A snapshot is a validated plugin bundle; isolates are seeded from it and
//!   replaced when a new one is activated
//! - A watchdog thread interrupts dispatches that outlive their timeout
//! - Context fields written by a request's first checkpoint are carried to
//!   its later checkpoints through a shared cache
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.create_snapshot("{}", scripts, "1.0.0")?;
//! let verdicts = engine.check("sql", br#"{"query":"..."}"#, Arc::new(MapContext::new()), 100);
//! ```

mod config;
mod context;
mod dispatch;
mod engine;
mod error;
mod js;
mod pool;
mod sink;
mod snapshot;
mod verdict;
mod watchdog;

pub use config::{ContextSchema, DEFAULT_CHECKPOINTS, EngineConfig};
pub use context::{ContextSource, MapContext, RequestContextCache};
pub use engine::Engine;
pub use error::{EngineError, EngineResult, LoadError, PoolError, ScriptError};
pub use pool::PoolStatus;
pub use sink::{LogSink, StackSource, TracingSink};
pub use snapshot::{PluginScript, Snapshot};
pub use verdict::{Action, MalformedVerdict, OUT_OF_MEMORY_MESSAGE, TIMEOUT_MESSAGE, Verdict, normalize};
