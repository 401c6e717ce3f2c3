//! Plugin Snapshots
//!
//! A snapshot is a validated plugin bundle: base configuration, plugin
//! sources in load order and a version tag. QuickJS has no heap images, so an
//! isolate is seeded by re-running the bundle on top of the prelude; a
//! snapshot only exists once every script has loaded cleanly in a throwaway
//! isolate.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LoadError;
use crate::js::IsolateFactory;

/// One plugin source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginScript {
    pub name: String,
    pub source: String,
}

impl PluginScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// An immutable, validated plugin bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    config: Value,
    scripts: Vec<PluginScript>,
    version: String,
    created_at: DateTime<Utc>,
    /// Checkpoint to plugin names, captured when the bundle was validated.
    #[serde(default)]
    registry: BTreeMap<String, Vec<String>>,
    /// Assigned on activation; 0 until then.
    #[serde(skip)]
    generation: u64,
}

impl Snapshot {
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn scripts(&self) -> &[PluginScript] {
        &self.scripts
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn registry(&self) -> &BTreeMap<String, Vec<String>> {
        &self.registry
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Write the bundle as JSON, replacing `path` atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()?;
        file.persist(path).map_err(|e| LoadError::Io(e.error))?;

        tracing::debug!("Saved snapshot {} to {}", self.version, path.display());
        Ok(())
    }

    /// Read a bundle written by [`Snapshot::save`]. It must be installed
    /// before use, which validates it again.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Parse the base configuration; blank text means an empty object.
fn parse_config(config: &str) -> Result<Value, LoadError> {
    if config.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(config).map_err(|e| LoadError::Config(e.to_string()))
}

/// Validates plugin bundles in throwaway isolates.
pub(crate) struct SnapshotBuilder<'a> {
    factory: &'a IsolateFactory,
}

impl<'a> SnapshotBuilder<'a> {
    pub(crate) fn new(factory: &'a IsolateFactory) -> Self {
        Self { factory }
    }

    pub(crate) fn build(
        &self,
        config: &str,
        scripts: Vec<PluginScript>,
        version: &str,
    ) -> Result<Snapshot, LoadError> {
        let config = parse_config(config)?;
        let isolate = self.factory.load(&config.to_string(), version, &scripts)?;
        let registry = isolate.registry().map_err(LoadError::Engine)?;

        tracing::debug!(
            "Validated {} plugin scripts ({} checkpoints registered)",
            scripts.len(),
            registry.len()
        );

        Ok(Snapshot {
            config,
            scripts,
            version: version.to_string(),
            created_at: Utc::now(),
            registry,
            generation: 0,
        })
    }

    /// Rebuild a snapshot read from disk.
    pub(crate) fn rebuild(&self, snapshot: Snapshot) -> Result<Snapshot, LoadError> {
        self.build(&snapshot.config.to_string(), snapshot.scripts, &snapshot.version)
    }
}
