use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::error::{BatchError, BatchPhase, StoreError};
use super::retry::RetryPolicy;
use super::store::{RangeSpec, RemoteStore, TableHandle};
use super::window::parse_timestamp_str;

pub const DEFAULT_DELETE_BATCH_SIZE: usize = 100;

#[derive(Debug, Default)]
pub struct CompactOutcome {
    pub deleted: usize,
    /// Rows whose timestamp cell could not be parsed. They are kept.
    pub unparsable: usize,
    pub errors: Vec<BatchError>,
    pub cancelled: bool,
}

/// Remote rows (1-based, header excluded) whose timestamp is older than
/// `cutoff`, in descending order. `cells` is the timestamp column as read,
/// row 1 first.
pub fn stale_rows(cells: &[Vec<String>], cutoff: DateTime<Utc>) -> (Vec<u32>, usize) {
    let mut rows = Vec::new();
    let mut unparsable = 0;
    for (offset, row) in cells.iter().enumerate().skip(1) {
        let text = row.first().map(|c| c.trim()).unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        match parse_timestamp_str(text) {
            Some(ts) if ts < cutoff => rows.push(offset as u32 + 1),
            Some(_) => {}
            None => unparsable += 1,
        }
    }
    rows.sort_unstable_by(|a, b| b.cmp(a));
    (rows, unparsable)
}

pub struct Compactor<'a> {
    pub store: &'a dyn RemoteStore,
    pub retry: &'a RetryPolicy,
    pub batch_size: usize,
    pub cancel: &'a AtomicBool,
}

impl Compactor<'_> {
    /// Deletes every row whose value in `timestamp_col` (1-based) predates
    /// `cutoff`. Runs after all writes of a run; rows are removed highest
    /// first so queued row numbers stay valid.
    ///
    /// Only an auth failure is returned as an error. Other failures are
    /// recorded on the outcome.
    pub async fn compact(
        &self,
        handle: &mut TableHandle,
        timestamp_col: u32,
        cutoff: DateTime<Utc>,
    ) -> Result<CompactOutcome, StoreError> {
        let mut outcome = CompactOutcome::default();
        let range = RangeSpec::column(&handle.tab, timestamp_col);
        let target: &TableHandle = handle;
        let read = self
            .retry
            .run("read timestamp column", || self.store.read_range(target, &range))
            .await;
        let cells = match read {
            Ok(cells) => cells,
            Err(err) if err.is_auth() => return Err(err),
            Err(err) => {
                warn!(table = %handle.tab, error = %err, "could not scan for stale rows");
                outcome.errors.push(BatchError {
                    phase: BatchPhase::Compact,
                    batch: 0,
                    rows: 0,
                    capacity: false,
                    message: err.to_string(),
                });
                return Ok(outcome);
            }
        };

        let (stale, unparsable) = stale_rows(&cells, cutoff);
        outcome.unparsable = unparsable;
        if stale.is_empty() {
            debug!(table = %handle.tab, "no stale rows");
            return Ok(outcome);
        }
        info!(table = %handle.tab, rows = stale.len(), %cutoff, "deleting stale rows");

        for (n, chunk) in stale.chunks(self.batch_size.max(1)).enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                outcome.cancelled = true;
                break;
            }
            let batch = n + 1;
            let target: &TableHandle = handle;
            let result = self
                .retry
                .run_throttled("delete rows", target.throttle(), || {
                    self.store.delete_rows(target, chunk)
                })
                .await;
            match result {
                Ok(()) => {
                    outcome.deleted += chunk.len();
                    handle.rows = handle.rows.saturating_sub(chunk.len() as u32);
                }
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    warn!(table = %handle.tab, batch, rows = chunk.len(), error = %err, "delete batch failed");
                    outcome.errors.push(BatchError {
                        phase: BatchPhase::Compact,
                        batch,
                        rows: chunk.len(),
                        capacity: false,
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }
}
