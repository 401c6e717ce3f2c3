//! Engine Errors
//!
//! Error types surfaced by snapshot building, pool management and script
//! evaluation. Checkpoint dispatch never returns these to the host; it logs
//! them and falls back to "no verdict".

/// Errors raised while building or installing a snapshot.
///
/// A failed build never replaces the active snapshot.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Invalid plugin configuration: {0}")]
    Config(String),

    #[error("Failed to load plugin script {name}: {message}")]
    Script { name: String, message: String },

    #[error("Plugin script {name} did not finish loading in time")]
    Timeout { name: String },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot file: {0}")]
    Format(#[from] serde_json::Error),
}

/// Errors raised when checking an isolate out of the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Isolate pool is busy")]
    Busy,

    #[error("Isolate pool has been disposed")]
    Disposed,

    #[error("No snapshot is active")]
    NoSnapshot,

    #[error("Failed to seed isolate: {0}")]
    Seed(#[source] LoadError),
}

/// Errors raised by ad-hoc script evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("{0}")]
    Exception(String),

    #[error("Script execution timed out after {0} ms")]
    Timeout(u64),

    #[error("Script isolate unavailable: {0}")]
    Unavailable(#[from] PoolError),
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Pool size must be at least 1")]
    InvalidPoolSize,

    #[error("Failed to start watchdog: {0}")]
    Watchdog(#[source] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
