use std::collections::HashMap;

use tracing::{info, warn};

use super::error::{StoreError, SyncWarning};
use super::record::detect_key_column;
use super::retry::RetryPolicy;
use super::store::{RangeSpec, RemoteStore, TableHandle};

/// Key -> row map for one remote table, rebuilt on every run.
#[derive(Debug, Clone, Default)]
pub struct RemoteIndex {
    /// Header row as stored remotely; `None` for a table that was never synced.
    pub header: Option<Vec<String>>,
    /// 0-based position of the key column within `header`.
    pub key_col: usize,
    pub rows: HashMap<String, u32>,
    /// First row after the last non-empty key cell.
    pub next_free_row: u32,
    pub warnings: Vec<SyncWarning>,
}

impl RemoteIndex {
    pub fn empty() -> Self {
        Self {
            next_free_row: 1,
            ..Self::default()
        }
    }

    pub fn row_of(&self, key: &str) -> Option<u32> {
        self.rows.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Finds `key_column` in a remote header. Falls back to name heuristics, then
/// to the first column.
pub fn locate_key_column(header: &[String], key_column: &str) -> (usize, Option<SyncWarning>) {
    if let Some(pos) = header.iter().position(|h| h.trim() == key_column) {
        return (pos, None);
    }
    let pos = detect_key_column(header.iter().map(String::as_str)).unwrap_or(0);
    let fallback = header.get(pos).cloned().unwrap_or_default();
    (pos, Some(SyncWarning::KeyColumnFallback { column: fallback }))
}

/// Reads the header row and the key column of `handle` and maps every key to
/// its row number. An empty table is a valid, empty index.
pub async fn build_index(
    store: &dyn RemoteStore,
    handle: &TableHandle,
    key_column: &str,
    retry: &RetryPolicy,
) -> Result<RemoteIndex, StoreError> {
    let header_range = RangeSpec::row(&handle.tab, 1);
    let header_rows = retry
        .run("read header", || store.read_range(handle, &header_range))
        .await?;
    let header = match header_rows.into_iter().next() {
        Some(row) if row.iter().any(|cell| !cell.trim().is_empty()) => row,
        _ => {
            info!(table = %handle.tab, "remote table is empty");
            return Ok(RemoteIndex::empty());
        }
    };

    let mut index = RemoteIndex::empty();
    let (key_col, fallback) = locate_key_column(&header, key_column);
    if let Some(warning) = fallback {
        warn!(table = %handle.tab, expected = key_column, "{warning}");
        index.warnings.push(warning);
    }

    let key_range = RangeSpec::column(&handle.tab, key_col as u32 + 1);
    let key_cells = retry
        .run("read key column", || store.read_range(handle, &key_range))
        .await?;

    for (offset, row) in key_cells.iter().enumerate().skip(1) {
        let row_number = offset as u32 + 1;
        let key = row.first().map(|cell| cell.trim()).unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        if index.rows.contains_key(key) {
            index.warnings.push(SyncWarning::RemoteDuplicateKey {
                key: key.to_string(),
                row: row_number,
            });
            continue;
        }
        index.rows.insert(key.to_string(), row_number);
    }

    index.next_free_row = (key_cells.len() as u32 + 1).max(2);
    index.key_col = key_col;
    index.header = Some(header);

    info!(
        table = %handle.tab,
        existing = index.rows.len(),
        next_free_row = index.next_free_row,
        "built remote index"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{strings, MemoryStore, Op};

    fn handle(store: &MemoryStore) -> TableHandle {
        let (rows, cols) = store.capacity("Tickets").unwrap();
        TableHandle::new("Tickets", 100, rows, cols)
    }

    #[tokio::test]
    async fn empty_table_is_valid() {
        let store = MemoryStore::new().with_table("Tickets", 1000, 26, Vec::new());
        let index = build_index(&store, &handle(&store), "Ticket ID", &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert!(index.header.is_none());
        assert!(index.is_empty());
        assert_eq!(index.next_free_row, 1);
        assert_eq!(store.calls_of(Op::Read).len(), 1);
    }

    #[tokio::test]
    async fn maps_keys_to_rows_reading_only_the_key_column() {
        let store = MemoryStore::new().with_table(
            "Tickets",
            1000,
            26,
            vec![
                strings(&["Subject", "Ticket ID", "Create date"]),
                strings(&["a", "10", "2025-01-01"]),
                strings(&["b", "11", "2025-01-02"]),
                strings(&["c", "", "2025-01-03"]),
                strings(&["d", "10", "2025-01-04"]),
            ],
        );
        let index = build_index(&store, &handle(&store), "Ticket ID", &RetryPolicy::no_retry())
            .await
            .unwrap();

        assert_eq!(index.key_col, 1);
        assert_eq!(index.row_of("10"), Some(2));
        assert_eq!(index.row_of("11"), Some(3));
        assert_eq!(index.len(), 2);
        assert_eq!(index.next_free_row, 6);
        assert_eq!(
            index.warnings,
            vec![SyncWarning::RemoteDuplicateKey {
                key: "10".into(),
                row: 5
            }]
        );
        let reads = store.calls_of(Op::Read);
        assert_eq!(reads[1].range.as_deref(), Some("'Tickets'!B:B"));
    }

    #[tokio::test]
    async fn unknown_key_column_falls_back_with_warning() {
        let store = MemoryStore::new().with_table(
            "Tickets",
            1000,
            26,
            vec![strings(&["Subject", "Owner"]), strings(&["hello", "amy"])],
        );
        let index = build_index(&store, &handle(&store), "Ticket ID", &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert_eq!(index.key_col, 0);
        assert_eq!(index.row_of("hello"), Some(2));
        assert!(matches!(
            index.warnings[0],
            SyncWarning::KeyColumnFallback { .. }
        ));
    }

    #[tokio::test]
    async fn read_failure_is_returned() {
        let store = MemoryStore::new().with_table("Tickets", 1000, 26, Vec::new());
        store.fail(Op::Read, 1, StoreError::Network("reset".into()));
        let result =
            build_index(&store, &handle(&store), "Ticket ID", &RetryPolicy::no_retry()).await;
        assert!(matches!(result, Err(StoreError::Network(_))));
    }
}
