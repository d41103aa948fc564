use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::capacity::{ensure_capacity, GrowthPolicy};
use crate::engine::enrich::{truncate_cell, DEFAULT_MAX_CELL_CHARS, TRUNCATION_MARKER};
use crate::engine::record::{ColumnDef, ColumnKind, Schema};
use crate::engine::retry::RetryPolicy;
use crate::engine::store::{RangeSpec, RemoteStore, TableHandle};
use crate::engine::{Authenticator, RunLogger, SyncRun, DEFAULT_WRITE_INTERVAL};

pub const SYNC_LOG_TAB: &str = "Sync_Log";

pub const SYNC_LOG_HEADERS: &[&str] = &[
    "Timestamp",
    "Run_ID",
    "Status",
    "Table",
    "Records_In",
    "Rows_Updated",
    "Rows_Inserted",
    "Rows_Deleted",
    "Duration_MS",
    "Duration_Readable",
    "Error_Count",
    "Warning_Count",
    "Details",
    "Last_Updated",
];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Appends one JSON object per run to a local file.
pub struct JsonlRunLog {
    path: PathBuf,
}

impl JsonlRunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, run: &SyncRun) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(run)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open run log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to write run log {}", self.path.display()))?;
        Ok(())
    }

    /// The newest `limit` runs, newest first. Lines that do not parse are
    /// skipped.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read run log {}", self.path.display()))
            }
        };
        let lines: Vec<&str> = data.lines().collect();
        let mut runs = Vec::new();
        for (n, line) in lines.iter().enumerate().rev() {
            if runs.len() >= limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SyncRun>(line) {
                Ok(run) => runs.push(run),
                Err(err) => {
                    warn!(path = %self.path.display(), line = n + 1, error = %err, "skipping run log entry")
                }
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunLogger for JsonlRunLog {
    async fn log_run(&self, run: &SyncRun) -> Result<()> {
        self.append(run)
    }
}

/// Appends one row per run to the `Sync_Log` tab of the target spreadsheet.
pub struct SheetRunLog {
    auth: Arc<dyn Authenticator>,
    retry: RetryPolicy,
    write_interval: std::time::Duration,
    // Concurrent runs would otherwise race for the same free row.
    lock: Mutex<()>,
}

impl SheetRunLog {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self {
            auth,
            retry: RetryPolicy::default(),
            write_interval: DEFAULT_WRITE_INTERVAL,
            lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_interval(mut self, interval: std::time::Duration) -> Self {
        self.write_interval = interval;
        self
    }

    async fn open_log(&self, store: &dyn RemoteStore) -> Result<TableHandle> {
        let opened = self
            .retry
            .run("open sync log", || store.open_table(SYNC_LOG_TAB))
            .await?;
        let handle = match opened {
            Some(handle) => handle,
            None => {
                let schema = Schema::new(
                    SYNC_LOG_HEADERS
                        .iter()
                        .map(|name| ColumnDef::new(*name, ColumnKind::Text))
                        .collect(),
                );
                self.retry
                    .run("create sync log", || store.create_table(SYNC_LOG_TAB, &schema))
                    .await?
            }
        };
        Ok(handle.with_write_interval(self.write_interval))
    }
}

#[async_trait]
impl RunLogger for SheetRunLog {
    async fn log_run(&self, run: &SyncRun) -> Result<()> {
        let _guard = self.lock.lock().await;
        let client = self.auth.get_valid_client().await?;
        let store = client.as_ref();
        let mut handle = self.open_log(store).await?;

        let target: &TableHandle = &handle;
        let first_range = RangeSpec::column(SYNC_LOG_TAB, 1);
        let first_column = self
            .retry
            .run("read sync log", || store.read_range(target, &first_range))
            .await?;
        let width = SYNC_LOG_HEADERS.len() as u32;
        let has_header = first_column
            .first()
            .and_then(|row| row.first())
            .is_some_and(|cell| cell == SYNC_LOG_HEADERS[0]);
        let used = first_column.len().max(1) as u32;
        let next_row = if has_header { used + 1 } else { 2 };

        ensure_capacity(
            store,
            &mut handle,
            next_row,
            width,
            &GrowthPolicy::default(),
            &self.retry,
        )
        .await?;

        if !has_header {
            let header: Vec<String> = SYNC_LOG_HEADERS.iter().map(|h| h.to_string()).collect();
            let target: &TableHandle = &handle;
            let range = RangeSpec::row_block(SYNC_LOG_TAB, 1, 1, width);
            self.retry
                .run_throttled("write sync log header", target.throttle(), || {
                    store.write_range(target, &range, vec![header.clone()])
                })
                .await?;
        }

        let row = log_row(run, Utc::now());
        let target: &TableHandle = &handle;
        let range = RangeSpec::row_block(SYNC_LOG_TAB, next_row, next_row, width);
        self.retry
            .run_throttled("append sync log", target.throttle(), || {
                store.write_range(target, &range, vec![row.clone()])
            })
            .await?;
        debug!(run_id = %run.id, row = next_row, "appended sync log row");
        Ok(())
    }
}

/// `1h 02m 03s`, `2m 05s` or `4.2s`.
pub fn readable_duration(ms: i64) -> String {
    let ms = ms.max(0);
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn details(run: &SyncRun) -> String {
    let mut parts = Vec::new();
    if let Some(message) = &run.message {
        parts.push(message.clone());
    }
    if run.cancelled {
        parts.push("cancelled".to_string());
    }
    for err in &run.batch_errors {
        parts.push(format!(
            "{} batch {} ({} rows): {}",
            err.phase, err.batch, err.rows, err.message
        ));
    }
    for warning in &run.warnings {
        parts.push(warning.to_string());
    }
    let text = parts.join("; ");
    truncate_cell(&text, DEFAULT_MAX_CELL_CHARS, TRUNCATION_MARKER).unwrap_or(text)
}

fn log_row(run: &SyncRun, logged_at: DateTime<Utc>) -> Vec<String> {
    let finished = run.ended_at.unwrap_or(run.started_at);
    let errors = run.batch_errors.len() + usize::from(run.message.is_some());
    vec![
        finished.format(TIME_FORMAT).to_string(),
        run.id.clone(),
        run.status.to_string(),
        run.table.clone(),
        run.records_in.to_string(),
        run.rows_updated.to_string(),
        run.rows_inserted.to_string(),
        run.rows_deleted.to_string(),
        run.duration_ms().to_string(),
        readable_duration(run.duration_ms()),
        errors.to_string(),
        run.warnings.len().to_string(),
        details(run),
        logged_at.format(TIME_FORMAT).to_string(),
    ]
}
