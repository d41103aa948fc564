use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use comfy_table::Table;

use crate::args::BaseArgs;
use crate::config;
use crate::engine::SyncRun;
use crate::runlog::{readable_duration, JsonlRunLog};
use crate::ui::{apply_column_padding, header, print_command_status, styled_table, truncate, CommandStatus};
use crate::utils::format_count;

#[derive(Debug, Clone, Args)]
pub struct RunsArgs {
    /// Number of runs to show
    #[arg(long, short = 'n', default_value_t = 20)]
    limit: usize,

    /// Only show runs for this table
    #[arg(long)]
    table: Option<String>,

    /// Local run log file (default: config run_log or sheetsync-runs.jsonl)
    #[arg(long)]
    run_log: Option<PathBuf>,
}

pub fn run(base: BaseArgs, args: RunsArgs) -> Result<()> {
    let path = match args.run_log {
        Some(path) => path,
        None => config::load()?.run_log_path(),
    };
    let log = JsonlRunLog::new(path);
    let runs = select_runs(&log, args.table.as_deref(), args.limit)?;

    if base.json {
        println!("{}", serde_json::to_string(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        print_command_status(
            CommandStatus::Warning,
            &format!("No runs recorded in {}", log.path().display()),
        );
        return Ok(());
    }
    println!("{}", runs_table(&runs));
    Ok(())
}

fn select_runs(log: &JsonlRunLog, table: Option<&str>, limit: usize) -> Result<Vec<SyncRun>> {
    let Some(table) = table else {
        return log.recent_runs(limit);
    };
    Ok(log
        .recent_runs(usize::MAX)?
        .into_iter()
        .filter(|run| run.table == table)
        .take(limit)
        .collect())
}

fn runs_table(runs: &[SyncRun]) -> Table {
    let mut table = styled_table();
    table.set_header(vec![
        header("Started"),
        header("Table"),
        header("Status"),
        header("In"),
        header("Updated"),
        header("Inserted"),
        header("Deleted"),
        header("Errors"),
        header("Duration"),
        header("Run ID"),
    ]);
    apply_column_padding(&mut table, (0, 2));
    for run in runs {
        table.add_row(vec![
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&run.table, 24),
            run.status.to_string(),
            format_count(run.records_in),
            format_count(run.rows_updated),
            format_count(run.rows_inserted),
            format_count(run.rows_deleted),
            format_count(run.batch_errors.len() + usize::from(run.message.is_some())),
            readable_duration(run.duration_ms()),
            run.id.clone(),
        ]);
    }
    table
}
