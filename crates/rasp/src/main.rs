//! RASP Plugin Tool
//!
//! Builds plugin snapshots, runs single checkpoints and evaluates scripts
//! against a plugin directory.

mod plugins;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rasp_js_runtime::{Engine, EngineConfig, Snapshot};

use plugins::{load_base_config, load_context, load_plugin_dir};

/// RASP plugin tool
#[derive(Parser, Debug)]
#[command(name = "rasp")]
#[command(about = "Run and package RASP JavaScript plugins", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch one checkpoint and print the verdicts
    Check {
        /// Directory of plugin scripts
        #[arg(short, long)]
        plugins: PathBuf,

        /// Base configuration handed to plugins (JSON)
        #[arg(long)]
        base_config: Option<PathBuf>,

        #[arg(long)]
        checkpoint: String,

        /// Checkpoint parameters (JSON)
        #[arg(long, default_value = "{}")]
        params: String,

        /// Request context file (JSON)
        #[arg(long)]
        context: Option<PathBuf>,

        /// Timeout in milliseconds, 0 for none
        #[arg(long, default_value = "100")]
        timeout: i64,
    },

    /// Evaluate a script with the plugins loaded
    Exec {
        #[arg(short, long)]
        plugins: PathBuf,

        #[arg(long)]
        base_config: Option<PathBuf>,

        script: PathBuf,
    },

    /// Validate a plugin directory and save it as a snapshot
    Snapshot {
        #[arg(short, long)]
        plugins: PathBuf,

        #[arg(long)]
        base_config: Option<PathBuf>,

        /// Version tag exposed to plugins
        #[arg(long, default_value = "0.0.0")]
        plugin_version: String,

        #[arg(short, long)]
        out: PathBuf,
    },

    /// Describe a saved snapshot
    Inspect { snapshot: PathBuf },

    /// Print the effective engine configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Check {
            plugins,
            base_config,
            checkpoint,
            params,
            context,
            timeout,
        } => {
            let engine = start_engine(config, &plugins, base_config.as_deref(), "0.0.0")?;
            let context = Arc::new(load_context(context.as_deref())?);
            let result = engine.check(&checkpoint, params.as_bytes(), context, timeout);
            engine.dispose();

            match result {
                Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
                None => println!("null"),
            }
        }
        Command::Exec {
            plugins,
            base_config,
            script,
        } => {
            let engine = start_engine(config, &plugins, base_config.as_deref(), "0.0.0")?;
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("reading script {}", script.display()))?;
            let filename = script.display().to_string();
            let result = engine.execute_script(&source, &filename);
            engine.dispose();

            println!("{}", result?);
        }
        Command::Snapshot {
            plugins,
            base_config,
            plugin_version,
            out,
        } => {
            let engine = start_engine(config, &plugins, base_config.as_deref(), &plugin_version)?;
            let snapshot = engine.snapshot().context("no snapshot is active")?;
            snapshot.save(&out)?;
            engine.dispose();

            info!("Saved snapshot {} to {}", snapshot.version(), out.display());
        }
        Command::Inspect { snapshot } => {
            let snapshot = Snapshot::load(&snapshot)
                .with_context(|| format!("loading snapshot {}", snapshot.display()))?;
            print_snapshot(&snapshot);
        }
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("RASP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("rasp=info,rasp_js_runtime=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

/// Defaults, then the TOML file, then `RASP_*` environment variables.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment
        .merge(Env::prefixed("RASP_"))
        .extract()
        .context("loading engine configuration")
}

fn start_engine(
    config: EngineConfig,
    plugins: &Path,
    base_config: Option<&Path>,
    version: &str,
) -> Result<Engine> {
    let scripts = load_plugin_dir(plugins)?;
    let base_config = load_base_config(base_config)?;

    let engine = Engine::new(config)?;
    engine.create_snapshot(&base_config, scripts, version)?;
    Ok(engine)
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("version:    {}", snapshot.version());
    println!("created at: {}", snapshot.created_at().to_rfc3339());
    println!("scripts:");
    for script in snapshot.scripts() {
        println!("  {} ({} bytes)", script.name, script.source.len());
    }
    println!("checkpoints:");
    for (checkpoint, plugins) in snapshot.registry() {
        println!("  {}: {}", checkpoint, plugins.join(", "));
    }
}
