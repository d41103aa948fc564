use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use crate::engine::error::SyncError;
use crate::engine::record::{ColumnDef, ColumnKind, Record, Schema, Value};
use crate::engine::RecordFeed;

/// Newline-delimited JSON records from a file, a `.gz` file, a directory of
/// `.jsonl`/`.ndjson` parts, or a glob pattern.
#[derive(Debug, Clone)]
pub struct JsonlFeed {
    source: String,
}

impl JsonlFeed {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn read(&self) -> Result<(Schema, Vec<Record>), SyncError> {
        let files = resolve_input_files(&self.source)?;
        let mut columns = ColumnTracker::default();
        let mut records = Vec::new();
        for path in &files {
            let reader = open_reader(path)?;
            let before = records.len();
            for (n, line) in reader.lines().enumerate() {
                let line = line.map_err(|err| feed_error(path, n + 1, err))?;
                if line.trim().is_empty() {
                    continue;
                }
                let object: Map<String, JsonValue> =
                    serde_json::from_str(&line).map_err(|err| feed_error(path, n + 1, err))?;
                records.push(to_record(object, &mut columns));
            }
            debug!(file = %path.display(), records = records.len() - before, "read feed file");
        }
        info!(source = %self.source, files = files.len(), records = records.len(), "loaded records");
        Ok((columns.into_schema(), records))
    }
}

#[async_trait]
impl RecordFeed for JsonlFeed {
    async fn produce_records(&self) -> Result<(Schema, Vec<Record>), SyncError> {
        let feed = self.clone();
        tokio::task::spawn_blocking(move || feed.read())
            .await
            .map_err(|err| SyncError::Feed(format!("feed reader stopped: {err}")))?
    }
}

fn feed_error(path: &Path, line: usize, err: impl std::fmt::Display) -> SyncError {
    SyncError::Feed(format!("{}:{line}: {err}", path.display()))
}

fn is_glob(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

fn resolve_input_files(source: &str) -> Result<Vec<PathBuf>, SyncError> {
    if is_glob(source) {
        let paths = glob::glob(source)
            .map_err(|err| SyncError::Feed(format!("invalid pattern {source}: {err}")))?;
        let mut files: Vec<PathBuf> = paths
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(SyncError::Feed(format!("no files match {source}")));
        }
        return Ok(files);
    }

    let path = Path::new(source);
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(SyncError::Feed(format!(
            "input path is neither file nor directory: {}",
            path.display()
        )));
    }
    let files = collect_json_input_files(path)?;
    if files.is_empty() {
        return Err(SyncError::Feed(format!(
            "no .jsonl or .ndjson files found in input directory {}",
            path.display()
        )));
    }
    Ok(files)
}

fn collect_json_input_files(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let entries = fs::read_dir(dir)
        .map_err(|err| SyncError::Feed(format!("failed to read {}: {err}", dir.display())))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| SyncError::Feed(format!("failed to read {}: {err}", dir.display())))?
            .path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if [".jsonl", ".ndjson", ".jsonl.gz", ".ndjson.gz"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>, SyncError> {
    let file = File::open(path)
        .map_err(|err| SyncError::Feed(format!("failed to open {}: {err}", path.display())))?;
    let inner: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(inner)))
}

/// Column descriptors in first-seen order. A column's kind comes from its
/// first non-null value.
#[derive(Default)]
struct ColumnTracker {
    defs: Vec<ColumnDef>,
    typed: Vec<bool>,
}

impl ColumnTracker {
    fn observe(&mut self, name: &str, kind: Option<ColumnKind>) {
        match self.defs.iter().position(|c| c.name == name) {
            Some(i) => {
                if let (false, Some(kind)) = (self.typed[i], kind) {
                    self.defs[i].kind = kind;
                    self.typed[i] = true;
                }
            }
            None => {
                self.defs
                    .push(ColumnDef::new(name, kind.unwrap_or(ColumnKind::Text)));
                self.typed.push(kind.is_some());
            }
        }
    }

    fn into_schema(self) -> Schema {
        Schema::new(self.defs)
    }
}

fn to_record(object: Map<String, JsonValue>, columns: &mut ColumnTracker) -> Record {
    let mut record = Record::new();
    for (name, json) in object {
        let (value, kind) = match json {
            JsonValue::Null => (Value::Empty, None),
            JsonValue::Bool(b) => (Value::Bool(b), Some(ColumnKind::Bool)),
            JsonValue::Number(n) => {
                let value = if let Some(i) = n.as_i64() {
                    Value::Integer(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    Value::Integer(i128::from(u))
                } else if let Some(f) = n.as_f64() {
                    Value::Number(f)
                } else {
                    Value::Text(n.to_string())
                };
                (value, Some(ColumnKind::Number))
            }
            JsonValue::String(s) => (Value::Text(s), Some(ColumnKind::Text)),
            nested => (Value::Text(nested.to_string()), Some(ColumnKind::Text)),
        };
        columns.observe(&name, kind);
        record.set(&name, value);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    const LINES: &str = concat!(
        r#"{"Ticket ID": 101, "Subject": "Printer", "Create date": "2025-05-01 10:00:00", "Escalated": false}"#,
        "\n\n",
        r#"{"Ticket ID": "102", "Subject": null, "Create date": "2025-05-02 11:00:00", "Tags": ["a", "b"]}"#,
        "\n",
    );

    #[test]
    fn reads_records_and_keeps_first_seen_column_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tickets.jsonl");
        fs::write(&path, LINES).unwrap();

        let (schema, records) = JsonlFeed::new(path.to_string_lossy()).read().unwrap();

        assert_eq!(
            schema.names(),
            vec!["Ticket ID", "Subject", "Create date", "Escalated", "Tags"]
        );
        assert_eq!(schema.columns()[0].kind, ColumnKind::Number);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cell("Ticket ID"), "101");
        assert_eq!(records[0].cell("Escalated"), "False");
        assert_eq!(records[1].get("Subject"), Some(&Value::Empty));
        assert_eq!(records[1].cell("Tags"), r#"["a","b"]"#);
    }

    #[test]
    fn large_integer_ids_stay_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.jsonl");
        fs::write(
            &path,
            "{\"id\": 12345678901234567, \"total\": 19.5}\n{\"id\": 12345678901234568, \"total\": 3}\n",
        )
        .unwrap();

        let (_, records) = JsonlFeed::new(path.to_string_lossy()).read().unwrap();
        let ids: Vec<String> = records.iter().map(|r| r.cell("id")).collect();
        assert_eq!(ids, vec!["12345678901234567", "12345678901234568"]);
        assert_eq!(records[0].cell("total"), "19.5");
        assert_eq!(records[1].cell("total"), "3");
    }

    #[test]
    fn reads_gzip_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tickets.jsonl.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(LINES.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let (_, records) = JsonlFeed::new(path.to_string_lossy()).read().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn reads_directories_and_globs_in_name_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("part-0002.jsonl"), "{\"id\": \"b\"}\n").unwrap();
        fs::write(dir.path().join("part-0001.jsonl"), "{\"id\": \"a\"}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (_, records) = JsonlFeed::new(dir.path().to_string_lossy()).read().unwrap();
        let ids: Vec<String> = records.iter().map(|r| r.cell("id")).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let pattern = dir.path().join("part-*.jsonl");
        let (_, records) = JsonlFeed::new(pattern.to_string_lossy()).read().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn invalid_json_names_file_and_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"id\": 1}\n{not json}\n").unwrap();

        let err = JsonlFeed::new(path.to_string_lossy()).read().unwrap_err();
        assert!(matches!(err, SyncError::Feed(_)));
        assert!(err.to_string().contains("bad.jsonl:2"));
    }

    #[test]
    fn missing_input_is_a_feed_error() {
        let dir = tempdir().unwrap();
        let err = JsonlFeed::new(dir.path().join("nope.jsonl").to_string_lossy())
            .read()
            .unwrap_err();
        assert!(err.to_string().contains("neither file nor directory"));
    }
}
