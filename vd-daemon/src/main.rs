//! Verdant Daemon (verdantd)
//!
//! Hosts the controller runtime: loads the JSON configuration, starts a loop
//! for every active controller and keeps the loops in sync with the file.
//!
//! # Signals
//! - **SIGHUP**: re-read the configuration and re-sync the controllers
//! - **SIGINT/SIGTERM**: stop every loop, turn outputs off and exit
//!
//! The configuration file is also polled for modification time changes, so
//! edits are picked up without a signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use vd_core::actions::JsonlNoteStore;
use vd_core::constants::{paths, timing};
use vd_core::data::JsonConfigStore;
use vd_core::hw::SysfsPinReader;
use vd_core::registry::DeviceRegistry;
use verdant::{RuntimeBuilder, Supervisor};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Process setup
// ============================================================================

/// Files we create (notes) are not world readable
fn set_umask() {
    // SAFETY: umask only sets the file creation mask of this process.
    unsafe { libc::umask(0o027) };
    debug!("Umask set to 0027");
}

/// Journald when the systemd journal socket exists, stdout otherwise
fn init_logging(filter: &str) -> bool {
    let journal = std::path::Path::new("/run/systemd/journal/socket").exists();
    if journal {
        match tracing_journald::layer() {
            Ok(layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(layer)
                    .with(tracing_subscriber::EnvFilter::new(filter))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    false
}

// ============================================================================
// CLI
// ============================================================================

struct Options {
    config: PathBuf,
    notes: Option<PathBuf>,
}

fn print_help() {
    eprintln!("verdantd {} - Verdant controller daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    verdantd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Configuration file");
    eprintln!("    -n, --notes PATH    Append notes created by actions to this JSONL file");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}      Configuration file (overridden by --config)", paths::CONFIG_ENV);
    eprintln!("    VERDANT_LOG         Log filter (trace, debug, info, warn, error)");
}

/// `None` when the process should exit without running
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options {
        config: paths::default_config_path(),
        notes: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("verdantd {}", VERSION);
                return Ok(None);
            }
            flag @ ("-c" | "--config" | "-n" | "--notes") => {
                i += 1;
                let value = args
                    .get(i)
                    .map(PathBuf::from)
                    .with_context(|| format!("{} requires a path argument", flag))?;
                if matches!(flag, "-c" | "--config") {
                    options.config = value;
                } else {
                    options.notes = Some(value);
                }
            }
            arg => {
                print_help();
                anyhow::bail!("unknown argument: {}", arg);
            }
        }
        i += 1;
    }
    Ok(Some(options))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    let log_filter = std::env::var("VERDANT_LOG").unwrap_or_else(|_| "info".to_string());
    let journald = init_logging(&log_filter);
    set_umask();

    info!("STARTUP: verdantd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });
    info!("STARTUP: Config: {}", options.config.display());

    let store = Arc::new(JsonConfigStore::new(&options.config));
    let registry = Arc::new(
        DeviceRegistry::load(store.clone())
            .with_context(|| format!("loading configuration from {}", options.config.display()))?,
    );

    let mut builder = RuntimeBuilder::new(registry).pins(Arc::new(SysfsPinReader::default()));
    if let Some(path) = &options.notes {
        info!("STARTUP: Notes: {}", path.display());
        builder = builder.notes(Arc::new(JsonlNoteStore::new(path)));
    }
    let supervisor = Supervisor::new(builder);
    supervisor.start_all().await;

    let shutdown = Arc::new(Notify::new());
    let on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        on_signal.notify_one();
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    let mut poll = tokio::time::interval(timing::CONFIG_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seen: Option<SystemTime> = store.modified();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = hangup.recv() => {
                info!("SIGNAL: Received SIGHUP - reloading configuration");
                seen = store.modified();
                if let Err(e) = supervisor.sync().await {
                    error!("CONTROL: Configuration reload failed: {}", e);
                }
            }
            _ = poll.tick() => {
                let modified = store.modified();
                if modified != seen {
                    seen = modified;
                    info!("CONTROL: Configuration file changed, re-syncing");
                    if let Err(e) = supervisor.sync().await {
                        error!("CONTROL: Configuration reload failed: {}", e);
                    }
                }
            }
        }
    }

    supervisor.shutdown().await;
    info!("SHUTDOWN: verdantd terminated gracefully");
    Ok(())
}
