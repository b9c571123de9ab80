mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;

use weft_bootstrap::logging::verbosity_level;
use weft_bootstrap::{ConfigOverrides, ValidatedConfig, discover_config, init_logging, load_layered};
use weft_runtime::PackageManager;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Weft - run a set of services behind one HTTP ingress
#[derive(Parser)]
#[command(name = "weft-server")]
#[command(about = "Weft - run a set of services behind one HTTP ingress")]
#[command(version)]
struct Cli {
    /// Path to configuration file (default: weft.yaml, weft.yml or weft.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Port override for the ingress (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every service and serve traffic (default)
    Run,
    /// Validate configuration, print the effective configuration and exit
    Check,
    /// Install dependencies of the project and of every service
    Install {
        /// Install production dependencies only
        #[arg(short = 'p', long)]
        production: bool,
        /// Package manager for services that do not declare one
        #[arg(short = 'P', long, value_parser = parse_package_manager)]
        package_manager: Option<PackageManager>,
    },
    /// Clone external services and install their dependencies
    Resolve {
        /// Install production dependencies only
        #[arg(short = 'p', long)]
        production: bool,
    },
    /// Run every service's build command
    Build,
}

fn parse_package_manager(raw: &str) -> Result<PackageManager, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Layered config:
    // 1) defaults -> 2) YAML/JSON (explicit or discovered) -> 3) env (WEFT__*) -> 4) CLI overrides
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => discover_config(&std::env::current_dir().context("cannot read current directory")?),
    };
    let mut config = load_layered(path.as_deref(), ConfigOverrides { port: cli.port })?;

    if let Some(level) = verbosity_level(cli.verbose) {
        level.clone_into(&mut config.config.logging.level);
    }
    let _log_guard = init_logging(&config.config.logging)?;

    tracing::info!(
        config = ?config.source,
        services = config.store.len(),
        "Weft starting"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => weft_bootstrap::run_server(config).await,
        Commands::Check => check_config(&config),
        Commands::Install {
            production,
            package_manager,
        } => commands::install(&config, production, package_manager).await,
        Commands::Resolve { production } => commands::resolve(&config, production).await,
        Commands::Build => commands::build(&config).await,
    }
}

fn check_config(config: &ValidatedConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    let services: Vec<_> = config
        .store
        .start_order()
        .iter()
        .filter_map(|id| config.store.get(id))
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "path": d.path.display().to_string(),
                "mount": config.store.mount_for(&d.id),
                "command": d.entrypoint.to_string(),
                "depends_on": d.depends_on,
                "watch": d.watch_enabled,
            })
        })
        .collect();

    println!("Configuration is valid");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "config": config.config,
            "start_order": services,
        }))?
    );
    Ok(())
}
