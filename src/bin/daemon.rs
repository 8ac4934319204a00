//! Satpass daemon: keeps the pass catalog in step with the decoder output.
//!
//! Every poll interval the daemon asks the update scheduler to start an
//! incremental run. The scheduler's cooldown and single-flight gate decide
//! whether a run actually happens; the daemon only logs the answer.
//!
//! ## Usage
//!
//! ```bash
//! satpass-daemon              # Run in foreground
//! satpass-daemon --once       # Run one update and exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use satpass::config::Config;
use satpass::tasks::{CatalogJob, JobStatus, UpdateScheduler};

/// Daemon configuration
struct DaemonConfig {
    /// Seconds between start requests
    poll_interval: u64,
    /// Run once and exit
    once: bool,
    /// Config path override
    config_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            once: false,
            config_path: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let daemon_config = parse_args();

    init_logging()?;

    info!("Satpass daemon starting...");

    let config = load_config(&daemon_config)?;
    info!(
        "Watching {} (catalog {})",
        config.paths.live_output_dir.display(),
        config.catalog_db_path().display()
    );

    let cooldown = Duration::from_secs(config.update.cooldown_secs);
    let scheduler = UpdateScheduler::new(Arc::new(CatalogJob::new(config)), cooldown);

    if daemon_config.once {
        info!("Running in single-shot mode");
        run_once(&scheduler).await;
    } else {
        info!(
            "Running in daemon mode, polling every {} seconds",
            daemon_config.poll_interval
        );
        run_daemon_loop(&scheduler, daemon_config.poll_interval).await;
    }

    info!("Satpass daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DaemonConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                config.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(interval) if interval > 0 => config.poll_interval = interval,
                        _ => eprintln!("Ignoring invalid interval: {}", args[i + 1]),
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_help() {
    println!(
        r#"satpass-daemon - Background catalog updater for satpass

USAGE:
    satpass-daemon [OPTIONS]

OPTIONS:
    --once, -1          Run one update and exit
    --interval, -i N    Poll interval in seconds (default: 60)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    SATPASS_CONFIG      Path to config file (overrides default location)
    SATPASS_LOG         Log level (trace, debug, info, warn, error)
"#
    );
}

/// journald when available, otherwise stderr.
fn init_logging() -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = || {
        tracing_subscriber::filter::EnvFilter::new(
            std::env::var("SATPASS_LOG").unwrap_or_else(|_| "info".to_string()),
        )
    };

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            let subscriber = tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter());
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
            return Ok(());
        }
    }

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter()).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    Ok(())
}

fn load_config(daemon_config: &DaemonConfig) -> Result<Config> {
    let path = daemon_config
        .config_path
        .clone()
        .unwrap_or_else(Config::config_path);

    if path.exists() {
        Config::load_from(&path)
    } else {
        warn!("Config file not found at {:?}, using defaults", path);
        Ok(Config::default())
    }
}

async fn run_daemon_loop(scheduler: &UpdateScheduler, poll_interval: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        request_update(scheduler);
    }
}

async fn run_once(scheduler: &UpdateScheduler) {
    if !request_update(scheduler) {
        return;
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = scheduler.status();
        if !status.in_progress {
            log_finished(&status);
            return;
        }
    }
}

/// Returns whether a run was started.
fn request_update(scheduler: &UpdateScheduler) -> bool {
    let ack = scheduler.start();
    if ack.accepted {
        info!("Update run {:?} started", ack.run_id);
    } else if let Some(secs) = ack.cooldown_secs {
        info!("Update on cooldown, {}s remaining", secs);
    } else if ack.in_progress {
        info!("Update already running (step {})", ack.step);
    }
    ack.accepted
}

fn log_finished(status: &JobStatus) {
    match &status.last_error {
        Some(err) => error!("Last update failed at {}: {}", status.step, err),
        None => info!(
            "Last update finished in {} ms",
            status.duration_ms.unwrap_or_default()
        ),
    }
}
