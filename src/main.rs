use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use satpass::config::Config;
use satpass::db::Database;
use satpass::logging;
use satpass::prefs::{PassConfig, PrefsStore};
use satpass::scanner::{run_catalog_update, RunMode};
use satpass::tasks::{CatalogJob, JobStatus, RepopulateOutcome, UpdateScheduler};

enum Command {
    Update,
    Repopulate,
    Remap,
    Seed(PathBuf),
    Status,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("satpass {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "update" => command = Some(Command::Update),
            "repopulate" => command = Some(Command::Repopulate),
            "remap" => command = Some(Command::Remap),
            "status" => command = Some(Command::Status),
            "seed" => {
                if i + 1 < args.len() {
                    command = Some(Command::Seed(PathBuf::from(&args[i + 1])));
                    i += 1;
                } else {
                    eprintln!("Error: seed requires a rules file");
                    std::process::exit(1);
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let Some(command) = command else {
        print_help();
        std::process::exit(1);
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"satpass - satellite pass catalog maintenance

USAGE:
    satpass [OPTIONS] <COMMAND>

COMMANDS:
    update              Incremental catalog update plus thumbnails
    repopulate          Wipe the catalog and rebuild it from disk
    remap               Re-apply classification rules to stored images
    seed FILE           Import classification rules from a TOML file
    status              Show catalog counts

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    SATPASS_CONFIG      Path to config file (overrides default location)
    SATPASS_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/satpass/config.toml

See also: satpass-daemon --help"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Update => update(config).await,
        Command::Repopulate => repopulate(config).await,
        Command::Remap => remap(config).await,
        Command::Seed(path) => seed(&config, &path),
        Command::Status => status(&config),
    }
}

fn scheduler(config: Config) -> UpdateScheduler {
    let cooldown = Duration::from_secs(config.update.cooldown_secs);
    UpdateScheduler::new(Arc::new(CatalogJob::new(config)), cooldown)
}

async fn update(config: Config) -> Result<()> {
    let scheduler = scheduler(config);

    let ack = scheduler.start();
    println!("{}", serde_json::to_string_pretty(&ack)?);
    if !ack.accepted {
        return Ok(());
    }

    let status = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = scheduler.status();
        if !status.in_progress {
            break status;
        }
    };
    report(&status)
}

async fn repopulate(config: Config) -> Result<()> {
    match scheduler(config).repopulate().await {
        RepopulateOutcome::Rejected(ack) => {
            println!("{}", serde_json::to_string_pretty(&ack)?);
            Ok(())
        }
        RepopulateOutcome::Finished(status) => report(&status),
    }
}

fn report(status: &JobStatus) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    match &status.last_error {
        Some(err) => anyhow::bail!("{}", err),
        None => Ok(()),
    }
}

async fn remap(config: Config) -> Result<()> {
    let summary = tokio::task::spawn_blocking(move || {
        run_catalog_update(&config, RunMode::MetadataOnly, &AtomicBool::new(false))
    })
    .await??;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn seed(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file {}", path.display()))?;
    let rules = PassConfig::from_toml_str(&content)?;

    let mut prefs = PrefsStore::open(&config.prefs_db_path())?;
    prefs.initialize()?;
    prefs.seed_from_pass_config(&rules)?;

    println!(
        "Imported {} pass types, {} composites, {} folder includes",
        rules.pass_types.len(),
        rules.composites.len(),
        rules.folder_includes.len()
    );
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let mut db = Database::open(&config.catalog_db_path())?;
    db.initialize()?;

    println!("Catalog:            {}", config.catalog_db_path().display());
    println!("Passes:             {}", db.pass_count()?);
    println!("Images:             {}", db.image_count()?);
    println!("Pending thumbnails: {}", db.images_needing_thumbnails()?.len());
    Ok(())
}
