//! Host Collaborators
//!
//! The log sink receiving plugin and engine diagnostics, and the optional
//! stack source plugins can pull a host call stack from.

use std::sync::Arc;

use parking_lot::RwLock;

/// Receives free-form diagnostic lines.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, message: &str) {
        self(message)
    }
}

/// Default sink: forwards every line to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!(target: "rasp.plugin", "{}", message);
    }
}

/// Supplies the host call stack, one string per frame.
pub trait StackSource: Send + Sync {
    fn stack(&self) -> Option<Vec<String>>;
}

impl<F> StackSource for F
where
    F: Fn() -> Option<Vec<String>> + Send + Sync,
{
    fn stack(&self) -> Option<Vec<String>> {
        self()
    }
}

/// The collaborators currently installed on an engine.
///
/// Shared by every isolate; swapping a collaborator affects the next line
/// logged or stack pulled.
pub(crate) struct Sinks {
    logger: RwLock<Arc<dyn LogSink>>,
    stack: RwLock<Option<Arc<dyn StackSource>>>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            logger: RwLock::new(Arc::new(TracingSink)),
            stack: RwLock::new(None),
        }
    }
}

impl Sinks {
    pub(crate) fn set_logger(&self, logger: Option<Arc<dyn LogSink>>) {
        *self.logger.write() = logger.unwrap_or_else(|| Arc::new(TracingSink));
    }

    pub(crate) fn set_stack_source(&self, source: Option<Arc<dyn StackSource>>) {
        *self.stack.write() = source;
    }

    /// Deliver one line, trailing newlines stripped.
    pub(crate) fn log(&self, message: &str) {
        // Clone out so a sink may replace itself without deadlocking.
        let logger = self.logger.read().clone();
        logger.log(message.trim_end_matches(['\n', '\r']));
    }

    pub(crate) fn stack(&self) -> Option<Vec<String>> {
        let source = self.stack.read().clone();
        source.and_then(|s| s.stack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_sink_strips_newlines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sinks = Sinks::default();
        let captured = lines.clone();
        sinks.set_logger(Some(Arc::new(move |line: &str| {
            captured.lock().push(line.to_string())
        })));

        sinks.log("hello\n");
        sinks.log("a\nb");
        assert_eq!(*lines.lock(), vec!["hello".to_string(), "a\nb".to_string()]);
    }

    #[test]
    fn test_stack_source() {
        let sinks = Sinks::default();
        assert!(sinks.stack().is_none());

        sinks.set_stack_source(Some(Arc::new(|| Some(vec!["frame0".to_string()]))));
        assert_eq!(sinks.stack(), Some(vec!["frame0".to_string()]));

        sinks.set_stack_source(None);
        assert!(sinks.stack().is_none());
    }
}
