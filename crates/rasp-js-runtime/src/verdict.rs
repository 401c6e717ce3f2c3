//! Verdicts
//!
//! Normalizes raw handler results into [`Verdict`]s and encodes the wire
//! form returned by `check`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Message of the synthetic verdict produced when a dispatch times out.
pub const TIMEOUT_MESSAGE: &str = "Javascript plugin execution timeout";

/// Message of the synthetic verdict produced when an isolate runs out of heap.
pub const OUT_OF_MEMORY_MESSAGE: &str = "Javascript plugin out of memory";

// ─────────────────────────────────────────────────────────────────────────────
// Action
// ─────────────────────────────────────────────────────────────────────────────

/// What the host should do about a request.
///
/// `ignore` is accepted from plugins but never reaches the host: it is
/// filtered out during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Log,
    Block,
    Exception,
}

impl Action {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "log" => Some(Action::Log),
            "block" => Some(Action::Block),
            "exception" => Some(Action::Exception),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Log => "log",
            Action::Block => "block",
            Action::Exception => "exception",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Verdict
// ─────────────────────────────────────────────────────────────────────────────

/// A normalized plugin decision.
///
/// Serializes with the standard fields first (`action, message, name,
/// confidence`) followed by any extra fields the handler returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Number>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Verdict {
    /// A verdict that did not come from a handler, so carries no plugin
    /// name or confidence.
    pub fn synthetic(action: Action, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            name: None,
            confidence: None,
            extra: Map::new(),
        }
    }

    pub fn timeout(action: Action) -> Self {
        Self::synthetic(action, TIMEOUT_MESSAGE)
    }

    pub fn out_of_memory() -> Self {
        Self::synthetic(Action::Exception, OUT_OF_MEMORY_MESSAGE)
    }
}

/// A handler result carrying an action the host does not understand.
#[derive(Debug, thiserror::Error)]
#[error("unsupported action '{0}'")]
pub struct MalformedVerdict(pub String);

/// Normalize one handler's return value.
///
/// Returns `Ok(None)` for results that carry no decision: non-objects,
/// objects without a string `action`, and `action: "ignore"`.
pub fn normalize(plugin: &str, result: Value) -> Result<Option<Verdict>, MalformedVerdict> {
    let Value::Object(mut fields) = result else {
        return Ok(None);
    };

    let action = match fields.remove("action") {
        Some(Value::String(action)) => action,
        _ => return Ok(None),
    };
    if action == "ignore" {
        return Ok(None);
    }
    let action = Action::parse(&action).ok_or(MalformedVerdict(action))?;

    let message = match fields.remove("message") {
        Some(Value::String(message)) => message,
        Some(value) if !is_falsy(&value) => value.to_string(),
        _ => String::new(),
    };

    let name = match fields.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => plugin.to_string(),
    };

    let confidence = match fields.remove("confidence") {
        Some(Value::Number(n)) => n,
        _ => Number::from(0),
    };

    Ok(Some(Verdict {
        action,
        message,
        name: Some(name),
        confidence: Some(confidence),
        extra: fields,
    }))
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Encode verdicts for the host. An empty list means "no verdict".
pub fn encode(verdicts: &[Verdict]) -> Option<Vec<u8>> {
    if verdicts.is_empty() {
        return None;
    }
    match serde_json::to_vec(verdicts) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!("Failed to encode verdicts: {}", e);
            None
        }
    }
}
