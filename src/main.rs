//! Devlink CLI entry point

use clap::{Parser, Subcommand};
use devlink_watcher::WatchOptions;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "devlink")]
#[command(about = "Develop local packages against a real consumer project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Copy all files once and exit instead of watching
    #[arg(long, global = true)]
    scan_once: bool,

    /// Publish every watched package through the local registry
    #[arg(long, global = true)]
    force_registry: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a .devlinkrc file in the current directory
    Init {
        /// Absolute path to the source repository
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Watch only the named source packages
    Packages {
        /// Package names to watch
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show version
    Version,
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| {
        let value = value.trim().to_ascii_lowercase();
        !value.is_empty() && value != "0" && value != "false"
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = cli.verbose || env_is_truthy("VERBOSE");
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "devlink={log_level},devlink_core={log_level},devlink_registry={log_level},devlink_watcher={log_level}"
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = WatchOptions {
        scan_once: cli.scan_once,
        force_registry: cli.force_registry,
        verbose,
    };

    match cli.command {
        Some(Commands::Init { source }) => commands::init(source),
        Some(Commands::Packages { names }) => commands::watch(Some(names), options).await,
        Some(Commands::Version) => {
            println!("{} v{}", devlink_core::CLI_NAME, env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => commands::watch(None, options).await,
    }
}
