//! Upsert synchronization of keyed records into a spreadsheet-style store.
//!
//! One [`SyncEngine::run`] reconciles one logical table: enrich, window,
//! index, plan, write (growing the grid as needed), then compact rows that
//! fell out of the retention window. Phases run strictly in sequence; runs
//! for different tables share nothing and may run concurrently.

pub mod capacity;
pub mod compact;
pub mod enrich;
pub mod error;
pub mod index;
pub mod plan;
pub mod record;
pub mod retry;
pub mod store;
pub mod window;
pub mod writer;

#[cfg(test)]
pub mod memory;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use self::capacity::{GrowthPolicy, DEFAULT_COL_BUFFER, DEFAULT_ROW_BUFFER};
use self::compact::{Compactor, DEFAULT_DELETE_BATCH_SIZE};
use self::enrich::{migrate_schema, Enricher, DEFAULT_MAX_CELL_CHARS, TRUNCATION_MARKER};
use self::error::{BatchError, BatchPhase, StoreError, SyncError, SyncWarning};
use self::index::build_index;
use self::record::{detect_key_column, Record, Schema, TableSpec};
use self::retry::RetryPolicy;
use self::store::{RemoteStore, TableHandle};
use self::window::{cutoff, filter_window};
use self::writer::{
    BatchedWriter, WriterConfig, DEFAULT_INSERT_BATCH_SIZE, DEFAULT_UPDATE_BATCH_SIZE,
};

pub const DEFAULT_RETENTION_DAYS: u32 = 365;
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Hands out a store client with valid credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn get_valid_client(&self) -> Result<Arc<dyn RemoteStore>, SyncError>;
}

/// Source of the flat, keyed records for one table.
#[async_trait]
pub trait RecordFeed: Send + Sync {
    async fn produce_records(&self) -> Result<(Schema, Vec<Record>), SyncError>;
}

/// Sink for finished runs. Failures are logged and otherwise ignored.
#[async_trait]
pub trait RunLogger: Send + Sync {
    async fn log_run(&self, run: &SyncRun) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub retention_days: u32,
    pub max_cell_chars: usize,
    pub truncation_marker: String,
    pub update_batch_size: usize,
    pub insert_batch_size: usize,
    pub delete_batch_size: usize,
    pub row_buffer: u32,
    pub col_buffer: u32,
    /// Minimum spacing between mutating calls on one table.
    pub min_write_interval: Duration,
    pub retry: RetryPolicy,
    pub compact: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            max_cell_chars: DEFAULT_MAX_CELL_CHARS,
            truncation_marker: TRUNCATION_MARKER.to_string(),
            update_batch_size: DEFAULT_UPDATE_BATCH_SIZE,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            row_buffer: DEFAULT_ROW_BUFFER,
            col_buffer: DEFAULT_COL_BUFFER,
            min_write_interval: DEFAULT_WRITE_INTERVAL,
            retry: RetryPolicy::default(),
            compact: true,
        }
    }
}

impl SyncOptions {
    fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            update_batch_size: self.update_batch_size,
            insert_batch_size: self.insert_batch_size,
            growth: GrowthPolicy {
                row_buffer: self.row_buffer,
                col_buffer: self.col_buffer,
            },
            retry: self.retry.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::PartialFailure => "PARTIAL_FAILURE",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report of one sync run. Final once `ended_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub table: String,
    pub tab: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_in: usize,
    #[serde(default)]
    pub records_windowed: usize,
    #[serde(default)]
    pub records_skipped: usize,
    #[serde(default)]
    pub records_outside_window: usize,
    #[serde(default)]
    pub values_truncated: usize,
    pub rows_updated: usize,
    pub rows_inserted: usize,
    pub rows_deleted: usize,
    #[serde(default)]
    pub capacity_resizes: usize,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub batch_errors: Vec<BatchError>,
    #[serde(default)]
    pub warnings: Vec<SyncWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncRun {
    pub fn start(spec: &TableSpec) -> Self {
        let started_at = Utc::now();
        Self {
            id: new_run_id(started_at),
            table: spec.name.clone(),
            tab: spec.tab.clone(),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            records_in: 0,
            records_windowed: 0,
            records_skipped: 0,
            records_outside_window: 0,
            values_truncated: 0,
            rows_updated: 0,
            rows_inserted: 0,
            rows_deleted: 0,
            capacity_resizes: 0,
            cancelled: false,
            batch_errors: Vec::new(),
            warnings: Vec::new(),
            message: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration().map(|d| d.num_milliseconds()).unwrap_or(0)
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

fn new_run_id(started_at: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 4];
    if getrandom::fill(&mut suffix).is_err() {
        suffix = started_at.timestamp_subsec_nanos().to_be_bytes();
    }
    let hex: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{hex}", started_at.format("%Y%m%dT%H%M%SZ"))
}

pub struct SyncEngine {
    auth: Arc<dyn Authenticator>,
    loggers: Vec<Arc<dyn RunLogger>>,
    options: SyncOptions,
    cancel: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(auth: Arc<dyn Authenticator>, options: SyncOptions) -> Self {
        Self {
            auth,
            loggers: Vec::new(),
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn RunLogger>) -> Self {
        self.loggers.push(logger);
        self
    }

    /// Shares a cancellation flag. Setting it stops the run before its next batch.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Runs one sync of `spec` and returns the final report. Never fails;
    /// fatal conditions end the run with status `FAILED`.
    pub async fn run(
        &self,
        spec: &TableSpec,
        feed: &dyn RecordFeed,
        now: DateTime<Utc>,
    ) -> SyncRun {
        let mut run = SyncRun::start(spec);
        info!(run_id = %run.id, table = %spec.name, tab = %spec.tab, "sync started");

        let result = self.execute(spec, feed, now, &mut run).await;
        run.ended_at = Some(Utc::now());
        run.status = match result {
            Err(err) => {
                error!(run_id = %run.id, table = %spec.name, error = %err, "sync failed");
                run.message = Some(err.to_string());
                RunStatus::Failed
            }
            Ok(()) if run.cancelled || !run.batch_errors.is_empty() => RunStatus::PartialFailure,
            Ok(()) => RunStatus::Completed,
        };
        info!(
            run_id = %run.id,
            table = %spec.name,
            status = %run.status,
            records_in = run.records_in,
            updated = run.rows_updated,
            inserted = run.rows_inserted,
            deleted = run.rows_deleted,
            errors = run.batch_errors.len(),
            "sync finished"
        );

        for logger in &self.loggers {
            if let Err(err) = logger.log_run(&run).await {
                warn!(run_id = %run.id, error = %err, "failed to record sync run");
            }
        }
        run
    }

    async fn execute(
        &self,
        spec: &TableSpec,
        feed: &dyn RecordFeed,
        now: DateTime<Utc>,
        run: &mut SyncRun,
    ) -> Result<(), SyncError> {
        let store = self.auth.get_valid_client().await?;
        let store = store.as_ref();
        let (mut schema, records) = feed.produce_records().await?;
        run.records_in = records.len();

        let key_column = resolve_key_column(spec, &schema, &mut run.warnings)?;
        migrate_schema(&mut schema, spec);

        let enricher = Enricher {
            max_cell_chars: self.options.max_cell_chars,
            marker: self.options.truncation_marker.clone(),
            now,
        };
        let enriched = enricher.enrich(spec, &schema, records);
        run.values_truncated = enriched.truncated_total();
        for (column, count) in &enriched.truncated {
            let warning = SyncWarning::ValueTooLarge {
                column: column.clone(),
                count: *count,
            };
            warn!(table = %spec.name, "{warning}");
            run.warnings.push(warning);
        }

        let window = filter_window(
            enriched.records,
            &spec.timestamp_column,
            self.options.retention_days,
            now,
        );
        run.records_windowed = window.records.len();
        run.records_skipped = window.skipped;
        run.records_outside_window = window.outside;
        if window.skipped > 0 {
            let warning = SyncWarning::UnparsableTimestamp {
                count: window.skipped,
            };
            warn!(table = %spec.name, "{warning}");
            run.warnings.push(warning);
        }

        let mut handle = self.open_or_create(store, spec, &schema).await?;
        let index = build_index(store, &handle, &key_column, &self.options.retry)
            .await
            .map_err(|source| index_error(spec, source))?;
        run.warnings.extend(index.warnings.iter().cloned());

        let plan = plan::plan(window.records, &key_column, &index);
        for warning in &plan.warnings {
            warn!(table = %spec.name, "{warning}");
        }
        run.warnings.extend(plan.warnings.iter().cloned());
        info!(
            table = %spec.name,
            updates = plan.updates.len(),
            inserts = plan.inserts.len(),
            "planned upsert"
        );

        let writer_config = self.options.writer_config();
        let outcome = BatchedWriter::new(store, &writer_config, &self.cancel)
            .execute(plan, &mut handle, &index, &schema)
            .await;
        run.rows_updated = outcome.updated;
        run.rows_inserted = outcome.inserted;
        run.capacity_resizes = outcome.resizes;
        run.cancelled = outcome.cancelled;
        run.batch_errors.extend(outcome.errors.iter().cloned());
        if let Some(err) = outcome.fatal {
            return Err(batch_error(&outcome.errors, err));
        }

        if !self.options.compact || run.cancelled {
            return Ok(());
        }
        let Some(ts_pos) = outcome
            .layout
            .iter()
            .position(|column| column == &spec.timestamp_column)
        else {
            warn!(
                table = %spec.name,
                column = %spec.timestamp_column,
                "timestamp column not in remote header; skipping compaction"
            );
            return Ok(());
        };
        let compactor = Compactor {
            store,
            retry: &self.options.retry,
            batch_size: self.options.delete_batch_size,
            cancel: &self.cancel,
        };
        let compacted = compactor
            .compact(
                &mut handle,
                ts_pos as u32 + 1,
                cutoff(now, self.options.retention_days),
            )
            .await
            .map_err(|err| SyncError::Auth(err.to_string()))?;
        run.rows_deleted = compacted.deleted;
        run.cancelled |= compacted.cancelled;
        run.batch_errors.extend(compacted.errors);
        Ok(())
    }

    async fn open_or_create(
        &self,
        store: &dyn RemoteStore,
        spec: &TableSpec,
        schema: &Schema,
    ) -> Result<TableHandle, SyncError> {
        let retry = &self.options.retry;
        let opened = retry
            .run("open table", || store.open_table(&spec.tab))
            .await
            .map_err(|source| index_error(spec, source))?;
        let handle = match opened {
            Some(handle) => handle,
            None => {
                info!(table = %spec.name, tab = %spec.tab, "creating remote table");
                retry
                    .run("create table", || store.create_table(&spec.tab, schema))
                    .await
                    .map_err(|source| index_error(spec, source))?
            }
        };
        Ok(handle.with_write_interval(self.options.min_write_interval))
    }
}

/// The configured key column, or the detected one with a warning.
fn resolve_key_column(
    spec: &TableSpec,
    schema: &Schema,
    warnings: &mut Vec<SyncWarning>,
) -> Result<String, SyncError> {
    if let Some(key) = &spec.key_column {
        return Ok(key.clone());
    }
    let names = schema.names();
    let pos = detect_key_column(names.iter().map(String::as_str)).unwrap_or(0);
    let column = names
        .get(pos)
        .cloned()
        .ok_or_else(|| SyncError::Feed(format!("no columns in feed for {}", spec.name)))?;
    let warning = SyncWarning::KeyColumnFallback {
        column: column.clone(),
    };
    warn!(table = %spec.name, "{warning}");
    warnings.push(warning);
    Ok(column)
}

fn index_error(spec: &TableSpec, source: StoreError) -> SyncError {
    if source.is_auth() {
        SyncError::Auth(source.to_string())
    } else {
        SyncError::IndexBuild {
            table: spec.name.clone(),
            source,
        }
    }
}

fn batch_error(errors: &[BatchError], source: StoreError) -> SyncError {
    if source.is_auth() {
        return SyncError::Auth(source.to_string());
    }
    let (phase, batch) = errors
        .last()
        .map(|e| (e.phase, e.batch))
        .unwrap_or((BatchPhase::Header, 0));
    SyncError::TransientBatch {
        phase,
        batch,
        source,
    }
}
