use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use futures_util::future::join_all;
use serde_json::json;

use crate::args::{BaseArgs, DEFAULT_API_URL};
use crate::auth::{default_credentials_path, CredentialsAuthenticator, StaticTokenAuthenticator};
use crate::config::{self, Config};
use crate::engine::record::TableSpec;
use crate::engine::{Authenticator, RunStatus, SyncEngine, SyncOptions, SyncRun};
use crate::feed::JsonlFeed;
use crate::runlog::{readable_duration, JsonlRunLog, SheetRunLog};
use crate::ui::{print_command_status, with_spinner, CommandStatus};
use crate::utils::{counted, format_count};

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    /// Table and its NDJSON source as TABLE=PATH (file, .gz, directory or glob). Repeatable.
    #[arg(long = "input", short = 'i', value_name = "TABLE=PATH", required = true, value_parser = parse_input)]
    inputs: Vec<(String, String)>,

    /// Keep records newer than this many days (default: config or 365)
    #[arg(long)]
    retention_days: Option<u32>,

    /// Reference time for the retention window and derived fields (RFC 3339)
    #[arg(long, value_parser = parse_now)]
    now: Option<DateTime<Utc>>,

    /// Skip deleting remote rows that fell out of the retention window
    #[arg(long)]
    no_compact: bool,

    /// Also append each run to the Sync_Log tab
    #[arg(long)]
    sheet_log: bool,

    /// Local run log file (default: config run_log or sheetsync-runs.jsonl)
    #[arg(long)]
    run_log: Option<PathBuf>,
}

fn parse_input(value: &str) -> std::result::Result<(String, String), String> {
    let (table, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected TABLE=PATH, got {value:?}"))?;
    let (table, path) = (table.trim(), path.trim());
    if table.is_empty() || path.is_empty() {
        return Err(format!("expected TABLE=PATH, got {value:?}"));
    }
    Ok((table.to_string(), path.to_string()))
}

fn parse_now(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC 3339 timestamp {value:?}: {err}"))
}

pub async fn run(base: BaseArgs, args: SyncArgs) -> Result<()> {
    let config = config::load()?;
    let auth = build_authenticator(&base, &config)?;
    let options = sync_options(&config, &args)?;
    let write_interval = options.min_write_interval;
    let now = args.now.unwrap_or_else(Utc::now);
    let jobs = plan_jobs(&config, &args.inputs)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_signal = Arc::clone(&cancel);
    let ctrlc_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current batch");
            cancel_signal.store(true, Ordering::SeqCst);
        }
    });

    let run_log_path = args.run_log.clone().unwrap_or_else(|| config.run_log_path());
    let mut engine = SyncEngine::new(Arc::clone(&auth), options)
        .with_cancel_flag(Arc::clone(&cancel))
        .with_logger(Arc::new(JsonlRunLog::new(run_log_path)));
    if args.sheet_log {
        engine = engine.with_logger(Arc::new(
            SheetRunLog::new(Arc::clone(&auth)).with_write_interval(write_interval),
        ));
    }

    let tables: Vec<&str> = jobs.iter().map(|(spec, _)| spec.name.as_str()).collect();
    let message = format!("Syncing {}", tables.join(", "));
    let runs: Vec<SyncRun> = with_spinner(
        &message,
        join_all(jobs.iter().map(|(spec, feed)| engine.run(spec, feed, now))),
    )
    .await;
    ctrlc_task.abort();

    if base.json {
        println!("{}", serde_json::to_string_pretty(&json!({ "runs": runs }))?);
    } else {
        for run in &runs {
            print_run_summary(run, base.verbose > 0);
        }
    }

    let failed = runs.iter().filter(|run| run.is_failed()).count();
    if failed > 0 {
        bail!("{} failed", counted(failed, "sync run"));
    }
    Ok(())
}

fn build_authenticator(base: &BaseArgs, config: &Config) -> Result<Arc<dyn Authenticator>> {
    let spreadsheet_id = base
        .spreadsheet_id
        .clone()
        .or_else(|| config.spreadsheet_id.clone())
        .ok_or_else(|| {
            anyhow!("no spreadsheet configured; pass --spreadsheet-id or run `sheetsync config set spreadsheet_id <ID>`")
        })?;
    let api_url = base
        .api_url
        .clone()
        .or_else(|| config.api_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    if let Some(token) = base.access_token.as_deref() {
        return Ok(Arc::new(StaticTokenAuthenticator::new(
            &api_url,
            &spreadsheet_id,
            token,
        )));
    }
    let path = match &base.credentials {
        Some(path) => path.clone(),
        None => default_credentials_path().context("failed to locate credentials file")?,
    };
    Ok(Arc::new(CredentialsAuthenticator::new(
        &api_url,
        &spreadsheet_id,
        path,
    )))
}

fn sync_options(config: &Config, args: &SyncArgs) -> Result<SyncOptions> {
    let mut options = SyncOptions::default();
    if let Some(days) = args.retention_days.or(config.retention_days()?) {
        if days == 0 {
            bail!("--retention-days must be > 0");
        }
        options.retention_days = days;
    }
    if let Some(interval) = config.write_interval()? {
        options.min_write_interval = interval;
    }
    options.compact = !args.no_compact;
    Ok(options)
}

fn plan_jobs(config: &Config, inputs: &[(String, String)]) -> Result<Vec<(TableSpec, JsonlFeed)>> {
    let mut seen_tabs = BTreeSet::new();
    let mut jobs = Vec::with_capacity(inputs.len());
    for (table, path) in inputs {
        let spec = config.resolve_table(table);
        // Two runs on one tab would race on the same rows.
        if !seen_tabs.insert(spec.tab.clone()) {
            bail!("tab {} is targeted more than once", spec.tab);
        }
        jobs.push((spec, JsonlFeed::new(path.as_str())));
    }
    Ok(jobs)
}

fn print_run_summary(run: &SyncRun, verbose: bool) {
    let status = match run.status {
        RunStatus::Completed => CommandStatus::Success,
        RunStatus::PartialFailure => CommandStatus::Warning,
        _ => CommandStatus::Error,
    };
    print_command_status(
        status,
        &format!(
            "{} -> {}: {} in {}",
            run.table,
            run.tab,
            run.status,
            readable_duration(run.duration_ms())
        ),
    );
    println!(
        "  {} in, {} updated, {} inserted, {} deleted",
        counted(run.records_in, "record"),
        format_count(run.rows_updated),
        format_count(run.rows_inserted),
        format_count(run.rows_deleted),
    );
    if run.records_outside_window > 0 || run.records_skipped > 0 {
        println!(
            "  {} outside the window, {} without a usable timestamp",
            format_count(run.records_outside_window),
            format_count(run.records_skipped),
        );
    }
    if let Some(message) = &run.message {
        println!("  error: {message}");
    }
    if run.cancelled {
        println!("  cancelled before all batches were written");
    }
    for err in &run.batch_errors {
        let kind = if err.capacity { " (grid resize)" } else { "" };
        println!(
            "  {} batch {}{kind}: {} not written: {}",
            err.phase,
            err.batch,
            counted(err.rows, "row"),
            err.message
        );
    }
    if verbose {
        for warning in &run.warnings {
            println!("  warning: {warning}");
        }
    } else if !run.warnings.is_empty() {
        println!("  {} (use -v to list)", counted(run.warnings.len(), "warning"));
    }
    println!("  run id: {}", run.id);
}
