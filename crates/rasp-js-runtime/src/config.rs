//! Engine Configuration
//!
//! Everything the engine consumes is passed in through [`EngineConfig`];
//! nothing is read from process-global state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::verdict::Action;

/// The checkpoints hosts dispatch by default.
pub const DEFAULT_CHECKPOINTS: &[&str] = &[
    "command",
    "directory",
    "fileUpload",
    "readFile",
    "request",
    "requestEnd",
    "sql",
    "sql_exception",
    "writeFile",
    "xxe",
    "ognl",
    "deserialization",
    "reflection",
    "webdav",
    "ssrf",
    "include",
    "eval",
    "copy",
    "rename",
    "loadLibrary",
];

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Isolate capacity of the pool.
    pub pool_size: usize,
    /// Callers allowed to queue for an isolate before `acquire` fails fast.
    pub max_waiters: usize,
    pub acquire_timeout_ms: u64,
    /// Per-isolate heap limit in bytes; 0 disables the limit.
    pub memory_limit: usize,
    pub max_stack_size: usize,
    /// Bound on a plugin's top-level code while building or seeding.
    pub load_timeout_ms: u64,
    /// Bound on `execute_script`; 0 disables it.
    pub script_timeout_ms: u64,
    /// How long an interrupted dispatch may take to unwind before the
    /// isolate is declared faulted.
    pub interrupt_grace_ms: u64,
    /// Action of the synthetic timeout verdict.
    pub timeout_action: Action,
    /// Declared checkpoint universe. Empty means any name is accepted.
    pub checkpoints: Vec<String>,
    /// Checkpoints that end a logical request.
    pub terminal_checkpoints: Vec<String>,
    pub context_ttl_secs: u64,
    pub context_sweep_interval_secs: u64,
    pub context: ContextSchema,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_waiters: 256,
            acquire_timeout_ms: 2000,
            memory_limit: 64 * 1024 * 1024,
            max_stack_size: 1024 * 1024,
            load_timeout_ms: 10_000,
            script_timeout_ms: 5000,
            interrupt_grace_ms: 500,
            timeout_action: Action::Exception,
            checkpoints: DEFAULT_CHECKPOINTS.iter().map(|s| s.to_string()).collect(),
            terminal_checkpoints: vec!["requestEnd".to_string()],
            context_ttl_secs: 300,
            context_sweep_interval_secs: 30,
            context: ContextSchema::default(),
        }
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl EngineConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        timeout(self.load_timeout_ms)
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        timeout(self.script_timeout_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }

    pub fn context_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.context_sweep_interval_secs)
    }

    /// Whether `checkpoint` belongs to the declared universe.
    pub fn is_known_checkpoint(&self, checkpoint: &str) -> bool {
        self.checkpoints.is_empty() || self.checkpoints.iter().any(|c| c == checkpoint)
    }

    pub fn is_terminal_checkpoint(&self, checkpoint: &str) -> bool {
        self.terminal_checkpoints.iter().any(|c| c == checkpoint)
    }
}

/// Declared context fields and the getter each one is pulled through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSchema {
    pub strings: Vec<String>,
    pub objects: Vec<String>,
    pub buffers: Vec<String>,
}

impl Default for ContextSchema {
    fn default() -> Self {
        let owned = |keys: &[&str]| -> Vec<String> { keys.iter().map(|k| k.to_string()).collect() };
        Self {
            strings: owned(&[
                "url",
                "path",
                "querystring",
                "method",
                "protocol",
                "remoteAddr",
                "appBasePath",
                "requestId",
            ]),
            objects: owned(&["header", "parameter", "server", "json"]),
            buffers: owned(&["body"]),
        }
    }
}
