//! Context Accessor Bridge
//!
//! Hosts expose per-request data through [`ContextSource`]. During a
//! dispatch the isolate reads it through a [`ContextView`], which pulls each
//! field from the host at most once.

mod cache;

pub use cache::RequestContextCache;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::sink::Sinks;

/// Per-request data supplied by the host.
///
/// Every getter returns `None` for a field the host does not have.
pub trait ContextSource: Send + Sync {
    /// Identity of the logical request, used to pair checkpoints such as
    /// `request` and `requestEnd`. `None` disables pairing.
    fn request_id(&self) -> Option<String> {
        None
    }

    fn string(&self, key: &str) -> Option<String>;

    /// JSON text of an object field.
    fn object(&self, key: &str) -> Option<Vec<u8>>;

    fn buffer(&self, key: &str) -> Option<Vec<u8>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// MapContext
// ─────────────────────────────────────────────────────────────────────────────

/// A [`ContextSource`] backed by owned maps.
///
/// Deserializes from `{"requestId", "strings", "objects", "buffers"}` where
/// buffers are UTF-8 text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapContext {
    pub request_id: Option<String>,
    pub strings: HashMap<String, String>,
    pub objects: HashMap<String, serde_json::Value>,
    pub buffers: HashMap<String, String>,
}

impl MapContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    pub fn with_object(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.objects.insert(key.into(), value);
        self
    }

    pub fn with_buffer(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.buffers.insert(key.into(), value.into());
        self
    }
}

impl ContextSource for MapContext {
    fn request_id(&self) -> Option<String> {
        self.request_id.clone()
    }

    fn string(&self, key: &str) -> Option<String> {
        self.strings.get(key).cloned()
    }

    fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .get(key)
            .and_then(|value| serde_json::to_vec(value).ok())
    }

    fn buffer(&self, key: &str) -> Option<Vec<u8>> {
        self.buffers.get(key).map(|text| text.as_bytes().to_vec())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ContextView
// ─────────────────────────────────────────────────────────────────────────────

/// The context of one dispatch, memoizing every host pull.
pub(crate) struct ContextView {
    source: Arc<dyn ContextSource>,
    strings: HashMap<String, Option<String>>,
    objects: HashMap<String, Option<String>>,
    buffers: HashMap<String, Option<Vec<u8>>>,
    stack: Option<Option<Vec<String>>>,
}

impl ContextView {
    pub(crate) fn new(source: Arc<dyn ContextSource>) -> Self {
        Self {
            source,
            strings: HashMap::new(),
            objects: HashMap::new(),
            buffers: HashMap::new(),
            stack: None,
        }
    }

    pub(crate) fn string(&mut self, key: &str) -> Option<String> {
        let source = &self.source;
        self.strings
            .entry(key.to_string())
            .or_insert_with(|| source.string(key))
            .clone()
    }

    /// JSON text of an object field. Invalid UTF-8 is replaced so the
    /// script-side parse fails cleanly instead.
    pub(crate) fn object(&mut self, key: &str) -> Option<String> {
        let source = &self.source;
        self.objects
            .entry(key.to_string())
            .or_insert_with(|| {
                source
                    .object(key)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .clone()
    }

    pub(crate) fn buffer(&mut self, key: &str) -> Option<Vec<u8>> {
        let source = &self.source;
        self.buffers
            .entry(key.to_string())
            .or_insert_with(|| source.buffer(key))
            .clone()
    }

    /// Host call stack, pulled at most once per dispatch.
    pub(crate) fn stack(&mut self, sinks: &Sinks) -> Option<Vec<String>> {
        self.stack.get_or_insert_with(|| sinks.stack()).clone()
    }
}
