//! Station driver binary
//!
//! Thin wiring only: flags, logging, the single-threaded runtime, and a
//! `Station` runner handed to the supervisor. The interesting behaviour
//! lives in the library crates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use nametag_device::Badge;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lobby_driver::{load_configs, supervise, GameTables, ScannerOptions, Station};

#[derive(Parser, Debug)]
#[command(name = "lobby_driver", about = "BLE nametag badge game station")]
struct Args {
    /// Regex matched against the adapter's USB vvvv:pppp id
    #[arg(long, default_value = nametag_transport::DEFAULT_PORT_PATTERN)]
    port_pattern: String,

    /// Badge assignment table (TOML; ids to team/flavor/note)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Game transition tables (TOML); defaults to the built-in set
    #[arg(long)]
    tables: Option<PathBuf>,

    /// Scheduler tuning knobs (TOML)
    #[arg(long)]
    options: Option<PathBuf>,

    /// Station id (0 = staff/welcome station)
    #[arg(long, default_value_t = 0)]
    station: u16,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // Single-threaded cooperative core: everything runs on one LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run(args)))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let configs = match &args.config {
        Some(path) => load_configs(path)?,
        None => HashMap::new(),
    };
    let tables = match &args.tables {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading game tables from {}", path.display()))?;
            GameTables::from_toml(&text)?
        }
        None => GameTables::builtin(),
    };
    let options = match &args.options {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading scanner options from {}", path.display()))?;
            toml::from_str::<ScannerOptions>(&text)?
        }
        None => ScannerOptions::default(),
    };
    let pattern = Regex::new(&args.port_pattern).context("--port-pattern")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt; shutting down...");
                shutdown.cancel();
            }
        });
    }

    let station = Rc::new(Station::new(args.station, configs, tables));
    let runner = move |badge: Badge| {
        let station = station.clone();
        async move { station.visit(&badge).await }
    };

    supervise(&pattern, runner, &options, shutdown).await
}
