use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::EnvFilter;

mod args;
mod auth;
mod config;
mod engine;
mod env;
mod feed;
mod runlog;
mod runs;
mod sheets;
mod sync;
mod ui;
mod utils;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("SHEETSYNC_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "sheetsync",
    about = "Upsert keyed records into spreadsheet tabs",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert NDJSON records into their tabs and drop rows past retention
    Sync(CLIArgs<sync::SyncArgs>),
    /// Show recent sync runs from the local run log
    Runs(CLIArgs<runs::RunsArgs>),
    /// View and change configuration
    Config(CLIArgs<config::ConfigArgs>),
}

impl Commands {
    fn verbosity(&self) -> u8 {
        match self {
            Commands::Sync(cmd) => cmd.base.verbose,
            Commands::Runs(cmd) => cmd.base.verbose,
            Commands::Config(cmd) => cmd.base.verbose,
        }
    }
}

/// `SHEETSYNC_LOG` wins over `-v`; otherwise warnings only.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "sheetsync=info",
        2 => "sheetsync=debug",
        _ => "sheetsync=trace",
    };
    let filter = EnvFilter::try_from_env("SHEETSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    let loaded = env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    init_tracing(cli.command.verbosity());
    for path in &loaded {
        tracing::debug!(path = %path.display(), "loaded env file");
    }

    match cli.command {
        Commands::Sync(cmd) => sync::run(cmd.base, cmd.args).await?,
        Commands::Runs(cmd) => runs::run(cmd.base, cmd.args)?,
        Commands::Config(cmd) => config::run(cmd.base, cmd.args)?,
    }

    Ok(())
}
