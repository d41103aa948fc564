use anyhow::{anyhow, bail, Result};
use clap::{Args, Subcommand};
use std::{
    collections::BTreeMap,
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::args::BaseArgs;
use crate::engine::record::{TableKind, TableSpec};
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

pub const DEFAULT_RUN_LOG: &str = "sheetsync-runs.jsonl";
const CONFIG_DIR: &str = "sheetsync";
const LOCAL_DIR: &str = ".sheetsync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub spreadsheet_id: Option<String>,
    pub api_url: Option<String>,
    pub retention_days: Option<String>,
    pub write_interval_ms: Option<String>,
    pub run_log: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, TableConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Where a logical table lives remotely. Unset fields fall back to the
/// built-in defaults for `tickets` and `chats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TableConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TableKind>,
}

pub const KNOWN_KEYS: &[&str] = &[
    "spreadsheet_id",
    "api_url",
    "retention_days",
    "write_interval_ms",
    "run_log",
];

impl Config {
    pub fn get_field(&self, key: &str) -> Option<&str> {
        match key {
            "spreadsheet_id" => self.spreadsheet_id.as_deref(),
            "api_url" => self.api_url.as_deref(),
            "retention_days" => self.retention_days.as_deref(),
            "write_interval_ms" => self.write_interval_ms.as_deref(),
            "run_log" => self.run_log.as_deref(),
            _ => None,
        }
    }

    fn slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            "spreadsheet_id" => Some(&mut self.spreadsheet_id),
            "api_url" => Some(&mut self.api_url),
            "retention_days" => Some(&mut self.retention_days),
            "write_interval_ms" => Some(&mut self.write_interval_ms),
            "run_log" => Some(&mut self.run_log),
            _ => None,
        }
    }

    pub fn set_field(&mut self, key: &str, value: String) -> bool {
        match self.slot(key) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match self.slot(key) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    pub fn non_empty_fields(&self) -> Vec<(&str, &str)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        let mut tables = self.tables.clone();
        for (name, table) in &other.tables {
            let merged = match tables.get(name) {
                Some(base) => base.merge(table),
                None => table.clone(),
            };
            tables.insert(name.clone(), merged);
        }
        let pick = |a: &Option<String>, b: &Option<String>| b.clone().or_else(|| a.clone());
        Config {
            spreadsheet_id: pick(&self.spreadsheet_id, &other.spreadsheet_id),
            api_url: pick(&self.api_url, &other.api_url),
            retention_days: pick(&self.retention_days, &other.retention_days),
            write_interval_ms: pick(&self.write_interval_ms, &other.write_interval_ms),
            run_log: pick(&self.run_log, &other.run_log),
            tables,
            extra,
        }
    }

    pub fn retention_days(&self) -> Result<Option<u32>> {
        self.retention_days
            .as_deref()
            .map(|v| {
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| anyhow!("retention_days must be a whole number of days, got {v:?}"))
            })
            .transpose()
    }

    pub fn write_interval(&self) -> Result<Option<Duration>> {
        self.write_interval_ms
            .as_deref()
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| anyhow!("write_interval_ms must be milliseconds, got {v:?}"))
            })
            .transpose()
    }

    pub fn run_log_path(&self) -> PathBuf {
        PathBuf::from(self.run_log.as_deref().unwrap_or(DEFAULT_RUN_LOG))
    }

    /// Resolves a logical table name to its remote location. Any name works;
    /// unknown names become generic tables on a tab of the same name.
    pub fn resolve_table(&self, name: &str) -> TableSpec {
        let configured = self.tables.get(name).cloned().unwrap_or_default();
        let table = builtin_table(name).merge(&configured);
        let kind = table.kind.unwrap_or_default();
        TableSpec {
            name: name.to_string(),
            tab: table.tab.unwrap_or_else(|| name.to_string()),
            kind,
            key_column: table.key_column,
            timestamp_column: table
                .timestamp_column
                .unwrap_or_else(|| "created_at".to_string()),
        }
    }
}

impl TableConfig {
    fn merge(&self, other: &TableConfig) -> TableConfig {
        TableConfig {
            tab: other.tab.clone().or_else(|| self.tab.clone()),
            key_column: other.key_column.clone().or_else(|| self.key_column.clone()),
            timestamp_column: other
                .timestamp_column
                .clone()
                .or_else(|| self.timestamp_column.clone()),
            kind: other.kind.or(self.kind),
        }
    }
}

fn builtin_table(name: &str) -> TableConfig {
    let (tab, key, ts, kind) = match name {
        "tickets" => ("Tickets", "Ticket ID", "Create date", TableKind::Tickets),
        "chats" => ("Chats", "chat_id", "chat_creation_date", TableKind::Chats),
        _ => return TableConfig::default(),
    };
    TableConfig {
        tab: Some(tab.to_string()),
        key_column: Some(key.to_string()),
        timestamp_column: Some(ts.to_string()),
        kind: Some(kind),
    }
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(CONFIG_DIR));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join(CONFIG_DIR))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not parse {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        tracing::warn!(key = %key, path = %path.display(), "unknown config key");
    }

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

/// Global only, local only, or the merged view.
pub fn load_scoped(global: bool, local: bool) -> Result<Config> {
    if global {
        load_global()
    } else if local {
        Ok(local_path().map(|p| load_file(&p)).unwrap_or_default())
    } else {
        load()
    }
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

fn find_local_config_dir_from(mut current_dir: PathBuf) -> Option<PathBuf> {
    let home = dirs::home_dir();
    loop {
        let candidate = current_dir.join(LOCAL_DIR);
        if candidate.is_dir() {
            return Some(candidate);
        }
        if current_dir.join(".git").exists() || Some(&current_dir) == home.as_ref() {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    let cwd = env::current_dir().ok()?;
    find_local_config_dir_from(cwd).map(|dir| dir.join("config.json"))
}

/// Resolve which config file to write based on --global/--local flags.
/// Without either, the nearest local file wins, else the global one.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    if let Some(p) = local_path() {
        return Ok(p);
    }
    if local {
        let dir = env::current_dir()?.join(LOCAL_DIR);
        return Ok(dir.join("config.json"));
    }
    global_path()
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/sheetsync/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.sheetsync/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source file
        #[arg(long)]
        sources: bool,
    },
    /// Get a config value
    Get {
        /// Config key (spreadsheet_id, api_url, retention_days, write_interval_ms, run_log)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (spreadsheet_id, api_url, retention_days, write_interval_ms, run_log)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (spreadsheet_id, api_url, retention_days, write_interval_ms, run_log)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    let mut candidate = Config::default();
    candidate.set_field(key, value.to_string());
    candidate.retention_days()?;
    candidate.write_interval()?;
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false, false),
        Some(ConfigCommands::List { scope, sources }) => {
            list::run(base, scope.global, scope.local, sources)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            validate_value(&key, &value)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
