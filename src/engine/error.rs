use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by a remote store binding.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not authorized ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limited by remote store: {0}")]
    RateLimited(String),

    #[error("remote store returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode remote response: {0}")]
    Decode(String),

    #[error("table not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_auth(&self) -> bool {
        matches!(self, StoreError::Auth { .. })
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::RateLimited(_) | StoreError::Network(_) => true,
            StoreError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => StoreError::Auth { status, message },
            404 => StoreError::NotFound(message),
            429 => StoreError::RateLimited(message),
            _ => StoreError::Http { status, message },
        }
    }
}

/// Errors that end or degrade a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("record feed failed: {0}")]
    Feed(String),

    #[error("could not build remote index for {table}: {source}")]
    IndexBuild {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("batch {batch} ({phase}) failed: {source}")]
    TransientBatch {
        phase: BatchPhase,
        batch: usize,
        #[source]
        source: StoreError,
    },

    #[error("could not grow {table} to {rows}x{cols}: {source}")]
    Capacity {
        table: String,
        rows: u32,
        cols: u32,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    /// Fatal errors stop the run with status `FAILED`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_) | SyncError::Feed(_) | SyncError::IndexBuild { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Header,
    Update,
    Insert,
    Compact,
}

impl std::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BatchPhase::Header => "header",
            BatchPhase::Update => "update",
            BatchPhase::Insert => "insert",
            BatchPhase::Compact => "compact",
        };
        f.write_str(label)
    }
}

/// A batch that did not apply. Recorded on the run; never aborts later batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub phase: BatchPhase,
    pub batch: usize,
    pub rows: usize,
    /// `true` when the batch was skipped because the grid could not be resized.
    #[serde(default)]
    pub capacity: bool,
    pub message: String,
}

/// Non-fatal conditions surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncWarning {
    ValueTooLarge { column: String, count: usize },
    DuplicateKey { key: String, dropped: usize },
    EmptyKey { count: usize },
    UnparsableTimestamp { count: usize },
    RemoteDuplicateKey { key: String, row: u32 },
    KeyColumnFallback { column: String },
}

impl std::fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncWarning::ValueTooLarge { column, count } => {
                write!(f, "truncated {count} oversized value(s) in '{column}'")
            }
            SyncWarning::DuplicateKey { key, dropped } => {
                write!(f, "key '{key}' repeated; dropped {dropped} earlier record(s)")
            }
            SyncWarning::EmptyKey { count } => {
                write!(f, "dropped {count} record(s) with an empty key")
            }
            SyncWarning::UnparsableTimestamp { count } => {
                write!(f, "skipped {count} record(s) with an unparsable timestamp")
            }
            SyncWarning::RemoteDuplicateKey { key, row } => {
                write!(f, "remote row {row} repeats key '{key}'")
            }
            SyncWarning::KeyColumnFallback { column } => {
                write!(f, "no key column configured; using '{column}'")
            }
        }
    }
}
