//! In-memory grid used by engine tests. Models capacity limits, trailing-cell
//! trimming on reads and row deletion the way a spreadsheet API behaves.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::StoreError;
use super::record::Schema;
use super::store::{RangeSpec, RangeWrite, RemoteStore, TableHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Open,
    Create,
    Read,
    Write,
    BatchWrite,
    Resize,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub range: Option<String>,
    pub rows: usize,
}

#[derive(Debug, Clone)]
struct Grid {
    sheet_id: i64,
    rows: u32,
    cols: u32,
    cells: Vec<Vec<String>>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Grid>,
    calls: Vec<Call>,
    counts: BTreeMap<Op, usize>,
    failures: Vec<(Op, usize, StoreError)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a table. `cells[0]` is row 1.
    pub fn with_table(self, tab: &str, rows: u32, cols: u32, cells: Vec<Vec<String>>) -> Self {
        {
            let mut state = self.lock();
            let sheet_id = state.tables.len() as i64 + 100;
            state.tables.insert(
                tab.to_string(),
                Grid {
                    sheet_id,
                    rows,
                    cols,
                    cells,
                },
            );
        }
        self
    }

    /// Makes the `nth` (1-based) call of `op` fail with `error`.
    pub fn fail(&self, op: Op, nth: usize, error: StoreError) {
        self.lock().failures.push((op, nth, error));
    }

    pub fn cells(&self, tab: &str) -> Vec<Vec<String>> {
        let state = self.lock();
        state
            .tables
            .get(tab)
            .map(|grid| trim_rows(grid.cells.clone()))
            .unwrap_or_default()
    }

    pub fn capacity(&self, tab: &str) -> Option<(u32, u32)> {
        self.lock().tables.get(tab).map(|g| (g.rows, g.cols))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(
        &self,
        op: Op,
        range: Option<&RangeSpec>,
        rows: usize,
    ) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        let count = {
            let entry = state.counts.entry(op).or_insert(0);
            *entry += 1;
            *entry
        };
        state.calls.push(Call {
            op,
            range: range.map(ToString::to_string),
            rows,
        });
        if let Some(pos) = state
            .failures
            .iter()
            .position(|(fail_op, nth, _)| *fail_op == op && *nth == count)
        {
            let (_, _, error) = state.failures.remove(pos);
            return Err(error);
        }
        Ok(state)
    }
}

fn grid_mut<'a>(state: &'a mut State, tab: &str) -> Result<&'a mut Grid, StoreError> {
    state
        .tables
        .get_mut(tab)
        .ok_or_else(|| StoreError::NotFound(tab.to_string()))
}

fn bounds(range: &RangeSpec, grid: &Grid) -> (u32, u32, u32, u32) {
    match range {
        RangeSpec::Rows { start, end, .. } => (*start, 1, *end, grid.cols),
        RangeSpec::Columns { start, end, .. } => (1, *start, grid.rows, *end),
        RangeSpec::Cells {
            first_row,
            first_col,
            last_row,
            last_col,
            ..
        } => (*first_row, *first_col, *last_row, *last_col),
    }
}

fn trim_rows(mut rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    for row in rows.iter_mut() {
        while row.last().is_some_and(|c| c.is_empty()) {
            row.pop();
        }
    }
    while rows.last().is_some_and(|r| r.is_empty()) {
        rows.pop();
    }
    rows
}

fn write_block(grid: &mut Grid, range: &RangeSpec, values: &[Vec<String>]) -> Result<(), StoreError> {
    let (first_row, first_col, _, _) = bounds(range, grid);
    for (r, row) in values.iter().enumerate() {
        let row_number = first_row + r as u32;
        let last_col = first_col + row.len().saturating_sub(1) as u32;
        if row_number > grid.rows || last_col > grid.cols {
            return Err(StoreError::Http {
                status: 400,
                message: format!(
                    "range {range} exceeds grid limits {}x{}",
                    grid.rows, grid.cols
                ),
            });
        }
        let index = (row_number - 1) as usize;
        if grid.cells.len() <= index {
            grid.cells.resize(index + 1, Vec::new());
        }
        let target = &mut grid.cells[index];
        let needed = (first_col as usize - 1) + row.len();
        if target.len() < needed {
            target.resize(needed, String::new());
        }
        for (c, value) in row.iter().enumerate() {
            target[first_col as usize - 1 + c] = value.clone();
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn open_table(&self, tab: &str) -> Result<Option<TableHandle>, StoreError> {
        let state = self.record(Op::Open, None, 0)?;
        Ok(state
            .tables
            .get(tab)
            .map(|grid| TableHandle::new(tab, grid.sheet_id, grid.rows, grid.cols)))
    }

    async fn create_table(&self, tab: &str, schema: &Schema) -> Result<TableHandle, StoreError> {
        let mut state = self.record(Op::Create, None, 0)?;
        let sheet_id = state.tables.len() as i64 + 100;
        let cols = (schema.len() as u32).max(26);
        state.tables.insert(
            tab.to_string(),
            Grid {
                sheet_id,
                rows: 1000,
                cols,
                cells: Vec::new(),
            },
        );
        Ok(TableHandle::new(tab, sheet_id, 1000, cols))
    }

    async fn read_range(
        &self,
        handle: &TableHandle,
        range: &RangeSpec,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let mut state = self.record(Op::Read, Some(range), 0)?;
        let grid = grid_mut(&mut state, &handle.tab)?;
        let (first_row, first_col, last_row, last_col) = bounds(range, grid);
        let mut out = Vec::new();
        for row_number in first_row..=last_row.min(grid.cells.len() as u32) {
            let row = &grid.cells[(row_number - 1) as usize];
            let slice: Vec<String> = (first_col..=last_col)
                .map(|c| row.get((c - 1) as usize).cloned().unwrap_or_default())
                .collect();
            out.push(slice);
        }
        Ok(trim_rows(out))
    }

    async fn write_range(
        &self,
        handle: &TableHandle,
        range: &RangeSpec,
        values: Vec<Vec<String>>,
    ) -> Result<(), StoreError> {
        let mut state = self.record(Op::Write, Some(range), values.len())?;
        let grid = grid_mut(&mut state, &handle.tab)?;
        write_block(grid, range, &values)
    }

    async fn batch_write_ranges(
        &self,
        handle: &TableHandle,
        writes: Vec<RangeWrite>,
    ) -> Result<(), StoreError> {
        let mut state = self.record(Op::BatchWrite, None, writes.len())?;
        let grid = grid_mut(&mut state, &handle.tab)?;
        let mut staged = grid.clone();
        for write in &writes {
            write_block(&mut staged, &write.range, &write.values)?;
        }
        *grid = staged;
        Ok(())
    }

    async fn resize_grid(
        &self,
        handle: &TableHandle,
        rows: u32,
        cols: u32,
    ) -> Result<(), StoreError> {
        let mut state = self.record(Op::Resize, None, rows as usize)?;
        let grid = grid_mut(&mut state, &handle.tab)?;
        grid.rows = rows;
        grid.cols = cols;
        Ok(())
    }

    async fn delete_rows(&self, handle: &TableHandle, rows: &[u32]) -> Result<(), StoreError> {
        let mut state = self.record(Op::Delete, None, rows.len())?;
        if rows.windows(2).any(|w| w[0] <= w[1]) {
            return Err(StoreError::Http {
                status: 400,
                message: "delete rows must be strictly descending".to_string(),
            });
        }
        let grid = grid_mut(&mut state, &handle.tab)?;
        for row in rows {
            let index = (*row - 1) as usize;
            if index < grid.cells.len() {
                grid.cells.remove(index);
            }
            grid.rows = grid.rows.saturating_sub(1);
        }
        Ok(())
    }
}

pub fn strings(row: &[&str]) -> Vec<String> {
    row.iter().map(|s| s.to_string()).collect()
}
