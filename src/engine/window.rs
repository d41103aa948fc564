use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use super::record::{Record, Value};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Parses a retention timestamp. Values without an offset are taken as UTC;
/// the record feed delivers timezone-normalized data.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Text(text) => parse_timestamp_str(text),
        _ => None,
    }
}

pub fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Oldest instant still inside a `retention_days` window ending at `now`.
pub fn cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(retention_days))
}

#[derive(Debug, Default)]
pub struct WindowOutcome {
    pub records: Vec<Record>,
    /// Records whose timestamp could not be parsed.
    pub skipped: usize,
    /// Records with a valid timestamp outside `[now - retention, now]`.
    pub outside: usize,
}

/// Keeps records whose `timestamp_column` lies within `[now - retention_days, now]`.
pub fn filter_window(
    records: Vec<Record>,
    timestamp_column: &str,
    retention_days: u32,
    now: DateTime<Utc>,
) -> WindowOutcome {
    let oldest = cutoff(now, retention_days);
    let mut outcome = WindowOutcome::default();
    for record in records {
        match record.get(timestamp_column).and_then(parse_timestamp) {
            None => outcome.skipped += 1,
            Some(ts) if ts < oldest || ts > now => outcome.outside += 1,
            Some(_) => outcome.records.push(record),
        }
    }
    outcome
}
