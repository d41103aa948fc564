use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::record::{ColumnDef, ColumnKind, Record, Schema, TableKind, TableSpec, Value};
use super::window::parse_timestamp;

pub const DEFAULT_MAX_CELL_CHARS: usize = 49_000;
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

const CALENDAR_COLUMNS: &[(&str, ColumnKind)] = &[
    ("Day_of_Week_Number", ColumnKind::Number),
    ("Day_of_Week_Name", ColumnKind::Text),
    ("Is_Weekend", ColumnKind::Bool),
    ("Is_Weekday", ColumnKind::Bool),
    ("FY_Quarter", ColumnKind::Number),
    ("FY_Quarter_Name", ColumnKind::Text),
    ("FY_Year", ColumnKind::Number),
    ("FY_Quarter_Full", ColumnKind::Text),
    ("Month_Number", ColumnKind::Number),
    ("Month_Name", ColumnKind::Text),
    ("Month_Year", ColumnKind::Text),
];

const TICKET_COLUMNS: &[(&str, ColumnKind)] = &[("Ticket_Age_Days", ColumnKind::Number)];

const CHAT_COLUMNS: &[(&str, ColumnKind)] = &[
    ("Hour_of_Day", ColumnKind::Number),
    ("Time_Period", ColumnKind::Text),
];

const CHAT_DURATION_COLUMNS: &[(&str, ColumnKind)] = &[
    ("Duration_Minutes", ColumnKind::Number),
    ("Duration_Hours", ColumnKind::Number),
];

// Populated later from the QA tracking sheet; created empty here.
const QA_COLUMNS: &[&str] = &[
    "QA - Evaluator Name",
    "QA - Ticket ID",
    "QA - Channel",
    "QA - Date of Interaction",
    "QA - 1. Revenue Opportunity",
    "QA - 2. SLA Adherence",
    "QA - 2a.",
    "QA - 3. SLA Miss Reason",
    "QA - 4. Unnecessary Interactions",
    "QA - 5. Technical Accuracy & Problem Resolution",
    "QA - 5a.",
    "QA - 6. Communication & Professionalism",
    "QA - 6a.",
    "QA - 7. Customer Service & Experience",
    "QA - 7a.",
    "QA - 8. Process Adherence & Efficiency",
    "QA - 8a.",
    "QA - 9. Case Management & Documentation",
    "QA - 9a.",
    "QA - 10. Customer Growth & Health",
    "QA - 10a.",
    "QA - 11. Revenue Impact Assessment",
    "QA - 12. Identified Root Cause",
    "QA - 12a.",
    "QA - 13. Suggestions for Deflection",
    "QA - 14. Tag for Systemic Review?",
    "QA - 15. Additional Comments / Coaching",
    "QA - Overall Performance Rating",
];

const METADATA_COLUMNS: &[(&str, ColumnKind)] = &[
    ("Last_Updated", ColumnKind::Text),
    ("Data_Type", ColumnKind::Text),
];

/// Columns the enricher adds for a table, in the order they are appended.
pub fn derived_columns(spec: &TableSpec, schema: &Schema) -> Vec<ColumnDef> {
    let to_defs = |cols: &[(&str, ColumnKind)]| {
        cols.iter()
            .map(|(name, kind)| ColumnDef::new(*name, *kind))
            .collect::<Vec<_>>()
    };

    let mut columns = Vec::new();
    match spec.kind {
        TableKind::Tickets => {
            columns.extend(to_defs(CALENDAR_COLUMNS));
            columns.extend(to_defs(TICKET_COLUMNS));
        }
        TableKind::Chats => {
            columns.extend(to_defs(CALENDAR_COLUMNS));
            columns.extend(to_defs(CHAT_COLUMNS));
            if schema.contains("duration_seconds") {
                columns.extend(to_defs(CHAT_DURATION_COLUMNS));
            }
        }
        TableKind::Generic => {}
    }
    if spec.kind != TableKind::Generic {
        columns.extend(QA_COLUMNS.iter().map(|n| ColumnDef::new(*n, ColumnKind::Text)));
    }
    columns.extend(to_defs(METADATA_COLUMNS));
    columns
}

/// Extends `schema` with the derived columns for `spec`. Run once per sync,
/// before any record is enriched.
pub fn migrate_schema(schema: &mut Schema, spec: &TableSpec) -> usize {
    let additions = derived_columns(spec, schema);
    schema.migrate(additions)
}

#[derive(Debug, Default)]
pub struct EnrichOutcome {
    pub records: Vec<Record>,
    /// Truncated cell count per column.
    pub truncated: BTreeMap<String, usize>,
}

impl EnrichOutcome {
    pub fn truncated_total(&self) -> usize {
        self.truncated.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct Enricher {
    pub max_cell_chars: usize,
    pub marker: String,
    pub now: DateTime<Utc>,
}

impl Enricher {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            max_cell_chars: DEFAULT_MAX_CELL_CHARS,
            marker: TRUNCATION_MARKER.to_string(),
            now,
        }
    }

    pub fn enrich(&self, spec: &TableSpec, schema: &Schema, records: Vec<Record>) -> EnrichOutcome {
        let mut outcome = EnrichOutcome::default();
        let last_updated = self.now.format("%Y-%m-%d %H:%M:%S").to_string();
        let with_duration = schema.contains("duration_seconds");

        for mut record in records {
            let created = record
                .get(&spec.timestamp_column)
                .and_then(parse_timestamp);

            if let Some(ts) = created {
                match spec.kind {
                    TableKind::Tickets => {
                        add_calendar_fields(&mut record, ts);
                        let age = (self.now - ts).num_seconds() as f64 / 86_400.0;
                        record.set("Ticket_Age_Days", round_to(age, 1));
                    }
                    TableKind::Chats => {
                        add_calendar_fields(&mut record, ts);
                        record.set("Hour_of_Day", ts.hour() as i64);
                        record.set("Time_Period", time_period(ts.hour()));
                    }
                    TableKind::Generic => {}
                }
            }

            if spec.kind == TableKind::Chats && with_duration {
                if let Some(secs) = record.get("duration_seconds").and_then(as_number) {
                    record.set("Duration_Minutes", round_to(secs / 60.0, 2));
                    record.set("Duration_Hours", round_to(secs / 3600.0, 2));
                }
            }

            if spec.kind != TableKind::Generic {
                for column in QA_COLUMNS {
                    if record.get(column).is_none() {
                        record.set(column, Value::Empty);
                    }
                }
            }

            record.set("Last_Updated", last_updated.as_str());
            record.set("Data_Type", spec.name.as_str());

            for (column, value) in record.values_mut() {
                if let Value::Text(text) = value {
                    if let Some(cut) = truncate_cell(text, self.max_cell_chars, &self.marker) {
                        *text = cut;
                        *outcome.truncated.entry(column.clone()).or_insert(0) += 1;
                    }
                }
            }

            outcome.records.push(record);
        }

        outcome
    }
}

/// Returns the truncated text when `text` exceeds `max_chars` characters.
pub fn truncate_cell(text: &str, max_chars: usize, marker: &str) -> Option<String> {
    let mut indices = text.char_indices();
    let (cut_at, _) = indices.nth(max_chars)?;
    let mut out = String::with_capacity(cut_at + marker.len());
    out.push_str(&text[..cut_at]);
    out.push_str(marker);
    Some(out)
}

fn add_calendar_fields(record: &mut Record, ts: DateTime<Utc>) {
    let weekday = ts.weekday();
    let day_number = weekday.number_from_monday() as i64;
    let is_weekend = day_number >= 6;
    let quarter = (ts.month() - 1) / 3 + 1;
    let quarter_name = format!("Q{quarter}");

    record.set("Day_of_Week_Number", day_number);
    record.set("Day_of_Week_Name", ts.format("%A").to_string());
    record.set("Is_Weekend", is_weekend);
    record.set("Is_Weekday", !is_weekend);
    record.set("FY_Quarter", quarter as i64);
    record.set("FY_Year", ts.year() as i64);
    record.set("FY_Quarter_Full", format!("{}-{quarter_name}", ts.year()));
    record.set("FY_Quarter_Name", quarter_name);
    record.set("Month_Number", ts.month() as i64);
    record.set("Month_Name", ts.format("%B").to_string());
    record.set("Month_Year", ts.format("%Y-%m (%B)").to_string());
}

fn time_period(hour: u32) -> &'static str {
    match hour {
        0..=5 => "Night (0-6)",
        6..=11 => "Morning (6-12)",
        12..=17 => "Afternoon (12-18)",
        _ => "Evening (18-24)",
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Integer(n) => Some(*n as f64),
        Value::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tickets() -> TableSpec {
        TableSpec {
            name: "tickets".into(),
            tab: "Tickets".into(),
            kind: TableKind::Tickets,
            key_column: Some("Ticket ID".into()),
            timestamp_column: "Create date".into(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn sixty_thousand_chars_truncate_to_ceiling_plus_marker() {
        let text = "x".repeat(60_000);
        let first = truncate_cell(&text, 49_000, TRUNCATION_MARKER).unwrap();
        let second = truncate_cell(&text, 49_000, TRUNCATION_MARKER).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 49_000 + TRUNCATION_MARKER.len());
        assert!(first.ends_with("x...[TRUNCATED]"));
        assert!(truncate_cell(&"y".repeat(49_000), 49_000, TRUNCATION_MARKER).is_none());
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "é".repeat(10);
        let cut = truncate_cell(&text, 4, "~").unwrap();
        assert_eq!(cut, "éééé~");
    }

    #[test]
    fn ticket_calendar_fields() {
        let spec = tickets();
        let mut schema = Schema::new(vec![
            ColumnDef::new("Ticket ID", ColumnKind::Text),
            ColumnDef::new("Create date", ColumnKind::Timestamp),
        ]);
        migrate_schema(&mut schema, &spec);
        let record = Record::new()
            .with("Ticket ID", "77")
            .with("Create date", "2025-05-31T09:00:00Z");

        let outcome = Enricher::new(now()).enrich(&spec, &schema, vec![record]);
        let enriched = &outcome.records[0];

        assert_eq!(enriched.cell("Day_of_Week_Name"), "Saturday");
        assert_eq!(enriched.cell("Day_of_Week_Number"), "6");
        assert_eq!(enriched.cell("Is_Weekend"), "True");
        assert_eq!(enriched.cell("FY_Quarter_Full"), "2025-Q2");
        assert_eq!(enriched.cell("Month_Year"), "2025-05 (May)");
        assert_eq!(enriched.cell("Ticket_Age_Days"), "1.1");
        assert_eq!(enriched.cell("Data_Type"), "tickets");
        assert_eq!(enriched.cell("Last_Updated"), "2025-06-01 12:00:00");
        assert_eq!(enriched.cell("Ticket ID"), "77");
        assert_eq!(enriched.cell("Create date"), "2025-05-31T09:00:00Z");
        assert!(schema.contains("QA - Overall Performance Rating"));
        assert!(enriched.get("QA - Channel").is_some());
    }

    #[test]
    fn chat_fields_include_period_and_duration() {
        let spec = TableSpec {
            name: "chats".into(),
            tab: "Chats".into(),
            kind: TableKind::Chats,
            key_column: Some("chat_id".into()),
            timestamp_column: "chat_creation_date".into(),
        };
        let mut schema = Schema::new(vec![
            ColumnDef::new("chat_id", ColumnKind::Text),
            ColumnDef::new("chat_creation_date", ColumnKind::Timestamp),
            ColumnDef::new("duration_seconds", ColumnKind::Number),
        ]);
        migrate_schema(&mut schema, &spec);
        assert!(schema.contains("Duration_Minutes"));

        let record = Record::new()
            .with("chat_id", "c-1")
            .with("chat_creation_date", "2025-05-30 19:15:00")
            .with("duration_seconds", 450.0);
        let outcome = Enricher::new(now()).enrich(&spec, &schema, vec![record]);
        let enriched = &outcome.records[0];
        assert_eq!(enriched.cell("Time_Period"), "Evening (18-24)");
        assert_eq!(enriched.cell("Hour_of_Day"), "19");
        assert_eq!(enriched.cell("Duration_Minutes"), "7.5");
        assert_eq!(enriched.cell("Duration_Hours"), "0.13");
    }

    #[test]
    fn oversized_cells_are_counted_per_column() {
        let spec = TableSpec {
            kind: TableKind::Generic,
            ..tickets()
        };
        let schema = Schema::new(vec![ColumnDef::new("Body", ColumnKind::Text)]);
        let records = vec![
            Record::new().with("Ticket ID", "1").with("Body", "a".repeat(60_000)),
            Record::new().with("Ticket ID", "2").with("Body", "short"),
        ];
        let outcome = Enricher::new(now()).enrich(&spec, &schema, records);
        assert_eq!(outcome.truncated.get("Body"), Some(&1));
        assert_eq!(outcome.truncated_total(), 1);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(
            outcome.records[0].cell("Body").chars().count(),
            49_000 + TRUNCATION_MARKER.len()
        );
    }
}
