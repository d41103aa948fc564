use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::capacity::{ensure_capacity, GrowthPolicy};
use super::error::{BatchError, BatchPhase, StoreError};
use super::index::RemoteIndex;
use super::plan::SyncPlan;
use super::record::Schema;
use super::retry::RetryPolicy;
use super::store::{RangeSpec, RangeWrite, RemoteStore, TableHandle};

pub const DEFAULT_UPDATE_BATCH_SIZE: usize = 500;
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Pending,
    WritingUpdates,
    WritingInserts,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Range writes per update call.
    pub update_batch_size: usize,
    /// Rows per insert call.
    pub insert_batch_size: usize,
    pub growth: GrowthPolicy,
    pub retry: RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            update_batch_size: DEFAULT_UPDATE_BATCH_SIZE,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            growth: GrowthPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub state: WriterState,
    pub updated: usize,
    pub inserted: usize,
    pub resizes: usize,
    pub errors: Vec<BatchError>,
    /// Column layout the rows were written in; the remote header after the run.
    pub layout: Vec<String>,
    pub cancelled: bool,
    /// Set when the writer stopped in `Failed`.
    pub fatal: Option<StoreError>,
}

/// Renders the remote column layout: the existing header followed by schema
/// columns it lacks. Returns the layout and whether the header must be written.
pub fn column_layout(header: Option<&[String]>, schema: &Schema) -> (Vec<String>, bool) {
    match header {
        None => (schema.names(), true),
        Some(header) => {
            let mut layout: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
            let before = layout.len();
            for name in schema.names() {
                if !layout.contains(&name) {
                    layout.push(name);
                }
            }
            let grew = layout.len() > before;
            (layout, grew)
        }
    }
}

pub struct BatchedWriter<'a> {
    store: &'a dyn RemoteStore,
    config: &'a WriterConfig,
    cancel: &'a AtomicBool,
    state: WriterState,
    batches_attempted: usize,
    batches_succeeded: usize,
}

enum Step {
    Continue,
    Stop,
}

impl<'a> BatchedWriter<'a> {
    pub fn new(store: &'a dyn RemoteStore, config: &'a WriterConfig, cancel: &'a AtomicBool) -> Self {
        Self {
            store,
            config,
            cancel,
            state: WriterState::Pending,
            batches_attempted: 0,
            batches_succeeded: 0,
        }
    }

    fn transition(&mut self, table: &str, next: WriterState) {
        debug!(table, from = ?self.state, to = ?next, "writer state");
        self.state = next;
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Records a failed batch. Auth failures, and a failure of the very first
    /// batch, stop the writer.
    fn on_failure(
        &mut self,
        outcome: &mut WriteOutcome,
        phase: BatchPhase,
        batch: usize,
        rows: usize,
        err: StoreError,
    ) -> Step {
        warn!(phase = %phase, batch, rows, error = %err, "batch failed");
        outcome.errors.push(BatchError {
            phase,
            batch,
            rows,
            capacity: false,
            message: err.to_string(),
        });
        if err.is_auth() || (self.batches_succeeded == 0 && self.batches_attempted == 1) {
            outcome.fatal = Some(err);
            return Step::Stop;
        }
        Step::Continue
    }

    pub async fn execute(
        mut self,
        plan: SyncPlan,
        handle: &mut TableHandle,
        index: &RemoteIndex,
        schema: &Schema,
    ) -> WriteOutcome {
        let (layout, header_needed) = column_layout(index.header.as_deref(), schema);
        let width = layout.len() as u32;
        let tab = handle.tab.clone();
        let mut outcome = WriteOutcome {
            state: WriterState::Pending,
            updated: 0,
            inserted: 0,
            resizes: 0,
            errors: Vec::new(),
            layout,
            cancelled: false,
            fatal: None,
        };

        if header_needed && !outcome.layout.is_empty() {
            if self.cancelled() {
                outcome.cancelled = true;
                return self.finish(&tab, outcome);
            }
            match self.write_header(handle, &mut outcome, width).await {
                Step::Continue => {}
                Step::Stop => return self.finish(&tab, outcome),
            }
        }

        self.transition(&tab, WriterState::WritingUpdates);
        for (n, chunk) in plan
            .updates
            .chunks(self.config.update_batch_size.max(1))
            .enumerate()
        {
            if self.cancelled() {
                outcome.cancelled = true;
                return self.finish(&tab, outcome);
            }
            let batch = n + 1;
            let writes: Vec<RangeWrite> = chunk
                .iter()
                .map(|(row, record)| RangeWrite {
                    range: RangeSpec::row_block(&tab, *row, *row, width),
                    values: vec![record.to_row(&outcome.layout)],
                })
                .collect();
            self.batches_attempted += 1;
            let target: &TableHandle = handle;
            let result = self
                .config
                .retry
                .run_throttled("write update batch", target.throttle(), || {
                    self.store.batch_write_ranges(target, writes.clone())
                })
                .await;
            match result {
                Ok(()) => {
                    self.batches_succeeded += 1;
                    outcome.updated += chunk.len();
                    debug!(table = %tab, batch, rows = chunk.len(), "update batch written");
                }
                Err(err) => {
                    if let Step::Stop =
                        self.on_failure(&mut outcome, BatchPhase::Update, batch, chunk.len(), err)
                    {
                        return self.finish(&tab, outcome);
                    }
                }
            }
        }

        self.transition(&tab, WriterState::WritingInserts);
        // row 1 is always the header
        let mut cursor = index.next_free_row.max(2);
        for (n, chunk) in plan
            .inserts
            .chunks(self.config.insert_batch_size.max(1))
            .enumerate()
        {
            if self.cancelled() {
                outcome.cancelled = true;
                return self.finish(&tab, outcome);
            }
            let batch = n + 1;
            let first_row = cursor;
            let last_row = first_row + chunk.len() as u32 - 1;

            match ensure_capacity(
                self.store,
                handle,
                last_row,
                width,
                &self.config.growth,
                &self.config.retry,
            )
            .await
            {
                Ok(true) => outcome.resizes += 1,
                Ok(false) => {}
                Err(err) if err.is_auth() => {
                    self.batches_attempted += 1;
                    if let Step::Stop =
                        self.on_failure(&mut outcome, BatchPhase::Insert, batch, chunk.len(), err)
                    {
                        return self.finish(&tab, outcome);
                    }
                    continue;
                }
                Err(err) => {
                    warn!(table = %tab, batch, rows = chunk.len(), error = %err, "skipping insert batch, grid could not grow");
                    outcome.errors.push(BatchError {
                        phase: BatchPhase::Insert,
                        batch,
                        rows: chunk.len(),
                        capacity: true,
                        message: err.to_string(),
                    });
                    continue;
                }
            }

            let range = RangeSpec::row_block(&tab, first_row, last_row, width);
            let values: Vec<Vec<String>> = chunk
                .iter()
                .map(|record| record.to_row(&outcome.layout))
                .collect();
            self.batches_attempted += 1;
            let target: &TableHandle = handle;
            let result = self
                .config
                .retry
                .run_throttled("write insert batch", target.throttle(), || {
                    self.store.write_range(target, &range, values.clone())
                })
                .await;
            match result {
                Ok(()) => {
                    self.batches_succeeded += 1;
                    outcome.inserted += chunk.len();
                    cursor = last_row + 1;
                    debug!(table = %tab, batch, rows = chunk.len(), first_row, "insert batch written");
                }
                Err(err) => {
                    if let Step::Stop =
                        self.on_failure(&mut outcome, BatchPhase::Insert, batch, chunk.len(), err)
                    {
                        return self.finish(&tab, outcome);
                    }
                }
            }
        }

        self.finish(&tab, outcome)
    }

    async fn write_header(
        &mut self,
        handle: &mut TableHandle,
        outcome: &mut WriteOutcome,
        width: u32,
    ) -> Step {
        match ensure_capacity(
            self.store,
            handle,
            1,
            width,
            &self.config.growth,
            &self.config.retry,
        )
        .await
        {
            Ok(true) => outcome.resizes += 1,
            Ok(false) => {}
            Err(err) => {
                self.batches_attempted += 1;
                return self.on_failure(outcome, BatchPhase::Header, 0, 1, err);
            }
        }

        let range = RangeSpec::row_block(&handle.tab, 1, 1, width);
        let values = vec![outcome.layout.clone()];
        self.batches_attempted += 1;
        let target: &TableHandle = handle;
        let result = self
            .config
            .retry
            .run_throttled("write header", target.throttle(), || {
                self.store.write_range(target, &range, values.clone())
            })
            .await;
        match result {
            Ok(()) => {
                self.batches_succeeded += 1;
                info!(table = %handle.tab, columns = width, "wrote header row");
                Step::Continue
            }
            Err(err) => self.on_failure(outcome, BatchPhase::Header, 0, 1, err),
        }
    }

    fn finish(mut self, table: &str, mut outcome: WriteOutcome) -> WriteOutcome {
        let end = if outcome.fatal.is_some() {
            WriterState::Failed
        } else {
            WriterState::Done
        };
        self.transition(table, end);
        outcome.state = self.state;
        info!(
            table,
            updated = outcome.updated,
            inserted = outcome.inserted,
            errors = outcome.errors.len(),
            cancelled = outcome.cancelled,
            "writer finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::index::build_index;
    use crate::engine::memory::{strings, MemoryStore, Op};
    use crate::engine::plan::plan;
    use crate::engine::record::{ColumnDef, ColumnKind, Record};

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnDef::new("id", ColumnKind::Text),
            ColumnDef::new("note", ColumnKind::Text),
        ])
    }

    fn config() -> WriterConfig {
        WriterConfig {
            retry: RetryPolicy::no_retry(),
            ..WriterConfig::default()
        }
    }

    async fn open(store: &MemoryStore) -> (TableHandle, RemoteIndex) {
        let handle = store.open_table("Data").await.unwrap().unwrap();
        let index = build_index(store, &handle, "id", &RetryPolicy::no_retry())
            .await
            .unwrap();
        (handle, index)
    }

    fn records(range: std::ops::RangeInclusive<u32>, note: &str) -> Vec<Record> {
        range
            .map(|i| Record::new().with("id", i.to_string()).with("note", note))
            .collect()
    }

    #[test]
    fn layout_appends_missing_schema_columns() {
        let header = strings(&["note", "legacy", "id"]);
        let schema = Schema::new(vec![
            ColumnDef::new("id", ColumnKind::Text),
            ColumnDef::new("note", ColumnKind::Text),
            ColumnDef::new("FY_Year", ColumnKind::Number),
        ]);
        let (layout, write) = column_layout(Some(&header), &schema);
        assert_eq!(layout, vec!["note", "legacy", "id", "FY_Year"]);
        assert!(write);

        let (layout, write) = column_layout(Some(&layout), &schema);
        assert_eq!(layout.len(), 4);
        assert!(!write);
    }

    #[tokio::test]
    async fn first_sync_writes_header_then_one_insert_batch() {
        let store = MemoryStore::new().with_table("Data", 1000, 26, Vec::new());
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(1..=1000, "n"), "id", &index);
        assert_eq!(plan.inserts.len(), 1000);

        let cancel = AtomicBool::new(false);
        let config = config();
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;

        assert_eq!(outcome.state, WriterState::Done);
        assert_eq!(outcome.inserted, 1000);
        assert!(outcome.errors.is_empty());
        let writes = store.calls_of(Op::Write);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].range.as_deref(), Some("'Data'!A1:B1"));
        assert_eq!(writes[1].range.as_deref(), Some("'Data'!A2:B1001"));
        let cells = store.cells("Data");
        assert_eq!(cells.len(), 1001);
        assert_eq!(cells[0], strings(&["id", "note"]));
        assert_eq!(cells[1000], strings(&["1000", "n"]));
    }

    #[tokio::test]
    async fn changed_record_rewrites_only_its_row() {
        let mut seeded = vec![strings(&["id", "note"])];
        seeded.extend((1..=500).map(|i| strings(&[&i.to_string(), "old"])));
        let store = MemoryStore::new().with_table("Data", 1000, 26, seeded.clone());
        let (mut handle, index) = open(&store).await;

        let mut input = records(1..=500, "old");
        input[76].set("note", "changed");
        let plan = plan(input, "id", &index);
        assert_eq!(plan.updates.len(), 500);
        assert!(plan.inserts.is_empty());

        let cancel = AtomicBool::new(false);
        let config = config();
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;
        assert_eq!(outcome.updated, 500);
        assert_eq!(store.calls_of(Op::BatchWrite).len(), 1);

        let after = store.cells("Data");
        let changed: Vec<usize> = (0..after.len()).filter(|i| after[*i] != seeded[*i]).collect();
        assert_eq!(changed, vec![77]);
        assert_eq!(after[77], strings(&["77", "changed"]));
    }

    #[tokio::test]
    async fn inserts_grow_the_grid_first() {
        let mut seeded = vec![strings(&["id", "note"])];
        seeded.extend((1..=400).map(|i| strings(&[&i.to_string(), "x"])));
        let store = MemoryStore::new().with_table("Data", 500, 26, seeded);
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(401..=1000, "y"), "id", &index);

        let cancel = AtomicBool::new(false);
        let config = config();
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;

        assert_eq!(outcome.inserted, 600);
        assert_eq!(outcome.resizes, 1);
        let resize = &store.calls_of(Op::Resize)[0];
        assert!(resize.rows >= 1001);
        assert!(handle.rows > 500);
        assert_eq!(store.cells("Data").len(), 1001);
    }

    #[tokio::test]
    async fn failed_batch_is_recorded_and_later_batches_continue() {
        let mut seeded = vec![strings(&["id", "note"])];
        seeded.extend((1..=10).map(|i| strings(&[&i.to_string(), "x"])));
        let store = MemoryStore::new().with_table("Data", 1000, 26, seeded);
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(1..=30, "y"), "id", &index);
        store.fail(Op::Write, 2, StoreError::Network("reset".into()));

        let cancel = AtomicBool::new(false);
        let config = WriterConfig {
            update_batch_size: 5,
            insert_batch_size: 5,
            ..config()
        };
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;

        assert_eq!(outcome.state, WriterState::Done);
        assert_eq!(outcome.updated, 10);
        assert_eq!(outcome.inserted, 15);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].phase, BatchPhase::Insert);
        assert_eq!(outcome.errors[0].batch, 2);
        let cells = store.cells("Data");
        // no gap where the failed batch would have gone
        assert_eq!(cells.len(), 26);
        assert!(cells.iter().skip(1).all(|row| !row[0].is_empty()));
    }

    #[tokio::test]
    async fn failed_resize_skips_the_chunk_without_leaving_a_gap() {
        let mut seeded = vec![strings(&["id", "note"])];
        seeded.extend((1..=10).map(|i| strings(&[&i.to_string(), "x"])));
        let store = MemoryStore::new().with_table("Data", 12, 26, seeded);
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(11..=20, "y"), "id", &index);
        store.fail(
            Op::Resize,
            1,
            StoreError::Http {
                status: 400,
                message: "grid limit".into(),
            },
        );

        let cancel = AtomicBool::new(false);
        let config = WriterConfig {
            insert_batch_size: 5,
            ..config()
        };
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;

        assert_eq!(outcome.state, WriterState::Done);
        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].capacity);
        assert_eq!(outcome.errors[0].batch, 1);
        assert_eq!(store.calls_of(Op::Resize).len(), 2);
        let writes = store.calls_of(Op::Write);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].range.as_deref(), Some("'Data'!A12:B16"));
        let cells = store.cells("Data");
        assert_eq!(cells.len(), 16);
        assert_eq!(cells[11], strings(&["16", "y"]));
    }

    #[tokio::test]
    async fn auth_failure_stops_the_writer() {
        let mut seeded = vec![strings(&["id", "note"])];
        seeded.extend((1..=10).map(|i| strings(&[&i.to_string(), "x"])));
        let store = MemoryStore::new().with_table("Data", 1000, 26, seeded);
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(1..=20, "y"), "id", &index);
        store.fail(
            Op::BatchWrite,
            2,
            StoreError::Auth {
                status: 401,
                message: "token expired".into(),
            },
        );

        let cancel = AtomicBool::new(false);
        let config = WriterConfig {
            update_batch_size: 5,
            ..config()
        };
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;

        assert_eq!(outcome.state, WriterState::Failed);
        assert!(outcome.fatal.as_ref().is_some_and(StoreError::is_auth));
        assert_eq!(outcome.updated, 5);
        assert!(store.calls_of(Op::Write).is_empty());
    }

    #[tokio::test]
    async fn first_batch_failure_escalates() {
        let store = MemoryStore::new().with_table("Data", 1000, 26, Vec::new());
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(1..=10, "y"), "id", &index);
        store.fail(
            Op::Write,
            1,
            StoreError::Http {
                status: 400,
                message: "bad range".into(),
            },
        );

        let cancel = AtomicBool::new(false);
        let config = config();
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;
        assert_eq!(outcome.state, WriterState::Failed);
        assert_eq!(outcome.errors[0].phase, BatchPhase::Header);
        assert_eq!(store.calls_of(Op::Write).len(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_batches() {
        let store = MemoryStore::new().with_table("Data", 1000, 26, Vec::new());
        let (mut handle, index) = open(&store).await;
        let plan = plan(records(1..=10, "y"), "id", &index);

        let cancel = AtomicBool::new(true);
        let config = config();
        let outcome = BatchedWriter::new(&store, &config, &cancel)
            .execute(plan, &mut handle, &index, &schema())
            .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.state, WriterState::Done);
        assert_eq!(outcome.inserted, 0);
        assert!(store.calls_of(Op::Write).is_empty());
    }
}
