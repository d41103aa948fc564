use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads `.env` files before clap reads `env = ...` defaults. Returns the
/// files that were read, lowest precedence first.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<Vec<PathBuf>> {
    let explicit_env_file = extract_env_file_arg(args);
    load_env(explicit_env_file.as_ref())
}

pub fn load_env(explicit_env_file: Option<&PathBuf>) -> Result<Vec<PathBuf>> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    let mut read = Vec::new();

    for env_file in resolve_env_files(&cwd, explicit_env_file) {
        if explicit_env_file.is_none() && !env_file.exists() {
            continue;
        }
        let entries = dotenvy::from_path_iter(&env_file)
            .with_context(|| format!("failed to read env file {}", env_file.display()))?;
        for entry in entries {
            let (key, value) = entry
                .with_context(|| format!("failed to parse env file {}", env_file.display()))?;
            // the process environment always wins over files
            if std::env::var_os(&key).is_none() {
                merged.insert(key, value);
            }
        }
        read.push(env_file);
    }

    for (key, value) in merged {
        std::env::set_var(key, value);
    }
    Ok(read)
}

fn extract_env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut explicit = None;
    let mut idx = 1usize;
    while idx < args.len() {
        let Some(arg) = args[idx].to_str() else {
            idx += 1;
            continue;
        };

        if arg == "--" {
            break;
        }

        if arg == "--env-file" {
            if let Some(next) = args.get(idx + 1) {
                explicit = Some(PathBuf::from(next));
            }
            idx += 2;
            continue;
        }

        if let Some(value) = arg.strip_prefix("--env-file=") {
            explicit = Some(PathBuf::from(value));
        }

        idx += 1;
    }
    explicit
}

fn resolve_env_files(cwd: &Path, explicit_env_file: Option<&PathBuf>) -> Vec<PathBuf> {
    if let Some(path) = explicit_env_file {
        let full_path = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };
        return vec![full_path];
    }

    let profile = std::env::var("SHEETSYNC_ENV").unwrap_or_else(|_| "production".to_string());
    let mut files = vec![cwd.join(".env"), cwd.join(format!(".env.{profile}"))];
    if profile != "test" {
        files.push(cwd.join(".env.local"));
    }
    files.push(cwd.join(format!(".env.{profile}.local")));
    files
}
