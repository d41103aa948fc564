use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::StoreError;
use super::record::Schema;

/// Reference to one remote table (a tab of a spreadsheet) and its grid size.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub tab: String,
    pub sheet_id: i64,
    pub rows: u32,
    pub cols: u32,
    throttle: Arc<WriteThrottle>,
}

impl TableHandle {
    pub fn new(tab: impl Into<String>, sheet_id: i64, rows: u32, cols: u32) -> Self {
        Self {
            tab: tab.into(),
            sheet_id,
            rows,
            cols,
            throttle: Arc::new(WriteThrottle::new(Duration::ZERO)),
        }
    }

    /// Replaces the throttle. Clones made afterwards share the new one.
    pub fn with_write_interval(mut self, interval: Duration) -> Self {
        self.throttle = Arc::new(WriteThrottle::new(interval));
        self
    }

    pub fn throttle(&self) -> &WriteThrottle {
        &self.throttle
    }
}

/// Minimum-interval limiter for mutating calls against one handle.
#[derive(Debug)]
pub struct WriteThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl WriteThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until `interval` has passed since the previous call returned from here.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// A1-notation range on one tab. Rows and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSpec {
    /// Whole rows `start..=end`.
    Rows { tab: String, start: u32, end: u32 },
    /// Whole columns `start..=end`.
    Columns { tab: String, start: u32, end: u32 },
    /// Rectangle from (`first_row`, `first_col`) to (`last_row`, `last_col`).
    Cells {
        tab: String,
        first_row: u32,
        first_col: u32,
        last_row: u32,
        last_col: u32,
    },
}

impl RangeSpec {
    pub fn row(tab: &str, row: u32) -> Self {
        RangeSpec::Rows {
            tab: tab.to_string(),
            start: row,
            end: row,
        }
    }

    pub fn column(tab: &str, col: u32) -> Self {
        RangeSpec::Columns {
            tab: tab.to_string(),
            start: col,
            end: col,
        }
    }

    /// Rows `first_row..=last_row` spanning columns `1..=cols`.
    pub fn row_block(tab: &str, first_row: u32, last_row: u32, cols: u32) -> Self {
        RangeSpec::Cells {
            tab: tab.to_string(),
            first_row,
            first_col: 1,
            last_row,
            last_col: cols.max(1),
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Rows { tab, start, end } => {
                write!(f, "{}!{start}:{end}", quote_tab(tab))
            }
            RangeSpec::Columns { tab, start, end } => write!(
                f,
                "{}!{}:{}",
                quote_tab(tab),
                column_letter(*start),
                column_letter(*end)
            ),
            RangeSpec::Cells {
                tab,
                first_row,
                first_col,
                last_row,
                last_col,
            } => write!(
                f,
                "{}!{}{first_row}:{}{last_row}",
                quote_tab(tab),
                column_letter(*first_col),
                column_letter(*last_col)
            ),
        }
    }
}

fn quote_tab(tab: &str) -> String {
    format!("'{}'", tab.replace('\'', "''"))
}

/// 1 -> A, 26 -> Z, 27 -> AA.
pub fn column_letter(mut n: u32) -> String {
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push((b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    letters.iter().rev().collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeWrite {
    pub range: RangeSpec,
    pub values: Vec<Vec<String>>,
}

/// The coarse-grained operations a spreadsheet-style store offers.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Looks up an existing table by tab title.
    async fn open_table(&self, tab: &str) -> Result<Option<TableHandle>, StoreError>;

    async fn create_table(&self, tab: &str, schema: &Schema) -> Result<TableHandle, StoreError>;

    /// Returns the non-empty prefix of the range, row-major. Trailing empty
    /// rows and cells are omitted, as spreadsheet APIs do.
    async fn read_range(
        &self,
        handle: &TableHandle,
        range: &RangeSpec,
    ) -> Result<Vec<Vec<String>>, StoreError>;

    async fn write_range(
        &self,
        handle: &TableHandle,
        range: &RangeSpec,
        values: Vec<Vec<String>>,
    ) -> Result<(), StoreError>;

    async fn batch_write_ranges(
        &self,
        handle: &TableHandle,
        writes: Vec<RangeWrite>,
    ) -> Result<(), StoreError>;

    async fn resize_grid(&self, handle: &TableHandle, rows: u32, cols: u32)
        -> Result<(), StoreError>;

    /// Deletes whole rows. `rows` must be in descending order.
    async fn delete_rows(&self, handle: &TableHandle, rows: &[u32]) -> Result<(), StoreError>;
}
