//! Plugin Directory Loading
//!
//! Reads plugin bundles and request contexts from disk.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use rasp_js_runtime::{MapContext, PluginScript};

/// Read every `*.js` file in `dir`, ordered by file name.
pub fn load_plugin_dir(dir: &Path) -> Result<Vec<PluginScript>> {
    if !dir.is_dir() {
        bail!("Plugin directory does not exist: {}", dir.display());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "js") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut scripts = Vec::with_capacity(paths.len());
    for path in paths {
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("reading plugin {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("Read plugin {}", name);
        scripts.push(PluginScript::new(name, source));
    }

    info!("Loaded {} plugin scripts from {}", scripts.len(), dir.display());
    Ok(scripts)
}

/// Read the optional base configuration handed to plugins as `config`.
pub fn load_base_config(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading base config {}", path.display())),
        None => Ok(String::new()),
    }
}

/// Read a request context file, or an empty context when none is given.
pub fn load_context(path: Option<&Path>) -> Result<MapContext> {
    let Some(path) = path else {
        return Ok(MapContext::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading context {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing context {}", path.display()))
}
