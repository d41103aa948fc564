use tracing::info;

use super::error::StoreError;
use super::retry::RetryPolicy;
use super::store::{RemoteStore, TableHandle};

pub const DEFAULT_ROW_BUFFER: u32 = 1000;
pub const DEFAULT_COL_BUFFER: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthPolicy {
    pub row_buffer: u32,
    pub col_buffer: u32,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            row_buffer: DEFAULT_ROW_BUFFER,
            col_buffer: DEFAULT_COL_BUFFER,
        }
    }
}

impl GrowthPolicy {
    /// Target grid size for a request, or `None` when the grid already fits.
    /// Never smaller than the current size on either axis.
    pub fn target(&self, current: (u32, u32), needed: (u32, u32)) -> Option<(u32, u32)> {
        let (rows, cols) = current;
        let (rows_needed, cols_needed) = needed;
        if rows_needed <= rows && cols_needed <= cols {
            return None;
        }
        let new_rows = if rows_needed > rows {
            (rows_needed.saturating_add(self.row_buffer)).max(rows.saturating_mul(2))
        } else {
            rows
        };
        let new_cols = if cols_needed > cols {
            (cols_needed.saturating_add(self.col_buffer)).max(cols.saturating_mul(2))
        } else {
            cols
        };
        Some((new_rows, new_cols))
    }
}

/// Grows `handle` so it holds at least `rows_needed` x `cols_needed` cells,
/// with one resize call. Returns whether a resize was issued.
pub async fn ensure_capacity(
    store: &dyn RemoteStore,
    handle: &mut TableHandle,
    rows_needed: u32,
    cols_needed: u32,
    growth: &GrowthPolicy,
    retry: &RetryPolicy,
) -> Result<bool, StoreError> {
    let Some((rows, cols)) = growth.target((handle.rows, handle.cols), (rows_needed, cols_needed))
    else {
        return Ok(false);
    };

    info!(
        table = %handle.tab,
        from = %format!("{}x{}", handle.rows, handle.cols),
        to = %format!("{rows}x{cols}"),
        "expanding remote grid"
    );
    let target: &TableHandle = handle;
    retry
        .run_throttled("resize grid", target.throttle(), || {
            store.resize_grid(target, rows, cols)
        })
        .await?;
    handle.rows = rows;
    handle.cols = cols;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryStore, Op};

    #[test]
    fn growth_takes_larger_of_buffer_and_doubling() {
        let growth = GrowthPolicy::default();
        assert_eq!(growth.target((500, 26), (1101, 26)), Some((2101, 26)));
        assert_eq!(growth.target((5000, 26), (5001, 26)), Some((10000, 26)));
        assert_eq!(growth.target((1000, 26), (10, 40)), Some((1000, 52)));
        assert_eq!(growth.target((1000, 26), (1000, 26)), None);
    }

    #[tokio::test]
    async fn grows_once_and_is_idempotent() {
        let store = MemoryStore::new().with_table("Tickets", 500, 26, Vec::new());
        let mut handle = TableHandle::new("Tickets", 100, 500, 26);
        let growth = GrowthPolicy::default();
        let retry = RetryPolicy::no_retry();

        let resized = ensure_capacity(&store, &mut handle, 1101, 30, &growth, &retry)
            .await
            .unwrap();
        assert!(resized);
        assert!(handle.rows >= 1101 && handle.rows > 500);
        assert_eq!(store.capacity("Tickets"), Some((handle.rows, handle.cols)));

        let before = (handle.rows, handle.cols);
        let resized = ensure_capacity(&store, &mut handle, 10, 5, &growth, &retry)
            .await
            .unwrap();
        assert!(!resized);
        assert_eq!((handle.rows, handle.cols), before);
        assert_eq!(store.calls_of(Op::Resize).len(), 1);
    }

    #[tokio::test]
    async fn failed_resize_leaves_handle_unchanged() {
        let store = MemoryStore::new().with_table("Tickets", 500, 26, Vec::new());
        store.fail(
            Op::Resize,
            1,
            StoreError::Http {
                status: 400,
                message: "grid limit".into(),
            },
        );
        let mut handle = TableHandle::new("Tickets", 100, 500, 26);
        let result = ensure_capacity(
            &store,
            &mut handle,
            2000,
            26,
            &GrowthPolicy::default(),
            &RetryPolicy::no_retry(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!((handle.rows, handle.cols), (500, 26));
    }
}
