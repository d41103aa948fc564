use std::path::PathBuf;

use clap::{ArgAction, Args};

pub use crate::sheets::DEFAULT_API_URL;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Target spreadsheet (or via SHEETSYNC_SPREADSHEET_ID)
    #[arg(long, env = "SHEETSYNC_SPREADSHEET_ID", global = true)]
    pub spreadsheet_id: Option<String>,

    /// Use this access token instead of stored credentials (or via SHEETSYNC_ACCESS_TOKEN)
    #[arg(
        long,
        env = "SHEETSYNC_ACCESS_TOKEN",
        hide_env_values = true,
        global = true
    )]
    pub access_token: Option<String>,

    /// Stored OAuth credentials file (or via SHEETSYNC_CREDENTIALS)
    #[arg(long, env = "SHEETSYNC_CREDENTIALS", global = true)]
    pub credentials: Option<PathBuf>,

    /// Override API URL (or via SHEETSYNC_API_URL)
    #[arg(
        long,
        env = "SHEETSYNC_API_URL",
        hide_env_values = true,
        global = true
    )]
    pub api_url: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "SHEETSYNC_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
