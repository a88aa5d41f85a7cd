// Canvas Runtime - Server process
// Hosts the runtime and its background loops
// Run with: cargo run --bin server

//! # Canvas Runtime Server Binary
//!
//! Starts a [`CanvasRuntime`] with the scheduler and lock sweep loops, installs an optional
//! definitions document and runs until Ctrl-C.
//!
//! ## Configuration
//!
//! - `canvas_runtime.{toml,json,yaml}` and `CANVAS_RUNTIME__*` variables, see `RuntimeConfig`
//! - `--definitions <file>` (or `CANVAS_RUNTIME_DEFINITIONS`) with rules, triggers and state
//!   machines to install at startup
//! - `RUST_LOG` overrides the configured log level
//!
//! ## Rust Learning Notes:
//!
//! ### Async Main Function
//! `#[tokio::main]` turns the async main into a synchronous one that builds the tokio runtime
//! first. The background loops are spawned onto that runtime by `CanvasRuntime::start`.
//!
//! ### anyhow in Binaries
//! The library returns its own typed errors; the binary only needs to report them, so
//! `anyhow::Result` with `.context(...)` is enough here.

use anyhow::{Context, Result};
use canvas_runtime::models::Definitions;
use canvas_runtime::{CanvasRuntime, RuntimeConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canvas-runtime-server")]
#[command(about = "Canvas runtime: behavior evaluation and collaborative locking")]
#[command(version)]
struct Cli {
    /// Definitions document (rules, triggers, state machines) to install at startup
    #[arg(long, env = "CANVAS_RUNTIME_DEFINITIONS")]
    definitions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Reads .env, the optional config file and CANVAS_RUNTIME__* variables
    let config = RuntimeConfig::load().context("failed to load runtime configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Canvas Runtime...");
    info!("=====================================");
    info!("Lock timeout: {}s", config.lock_timeout_seconds);
    info!("Lock sweep interval: {}s", config.lock_sweep_interval_seconds);
    info!("Scheduler poll interval: {}ms", config.scheduler_poll_interval_ms);
    info!("Client buffer: {} messages", config.client_buffer_capacity);

    let runtime = CanvasRuntime::new(config);

    match &cli.definitions {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let definitions = Definitions::from_json(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            for problem in definitions.problems() {
                warn!("⚠️  {}", problem);
            }
            runtime
                .install(definitions)
                .with_context(|| format!("failed to install {}", path.display()))?;
            info!("✅ Installed definitions from {}", path.display());
        }
        None => info!("No definitions document given, starting empty"),
    }

    runtime.start()?;
    info!("✅ Background loops running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("🛑 Shutting down...");
    runtime.shutdown().await;
    info!("👋 Canvas Runtime stopped");
    Ok(())
}
