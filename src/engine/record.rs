use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single scalar cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    /// Integral JSON numbers, kept exact so large ids survive.
    Integer(i128),
    Number(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Empty,
}

impl Value {
    /// Renders the value the way it is written to the remote grid (RAW input).
    pub fn to_cell(&self) -> String {
        match self {
            Value::Text(text) => text.clone(),
            Value::Integer(n) => n.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            Value::Empty => String::new(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Empty => true,
            Value::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(i128::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

fn format_number(n: f64) -> String {
    if !n.is_finite() {
        return String::new();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// One flat record keyed by column name. Column order comes from the [`Schema`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.values.insert(column.to_string(), value.into());
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.values.iter_mut()
    }

    /// The cell text of `column`, trimmed; empty when the column is absent.
    pub fn cell(&self, column: &str) -> String {
        self.values
            .get(column)
            .map(|value| value.to_cell().trim().to_string())
            .unwrap_or_default()
    }

    /// Renders the record as one row following `layout`.
    pub fn to_row(&self, layout: &[String]) -> Vec<String> {
        layout
            .iter()
            .map(|column| {
                self.values
                    .get(column)
                    .map(Value::to_cell)
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Number,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered column descriptor for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        let mut schema = Self::default();
        schema.migrate(columns);
        schema
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Appends every column not already present, keeping existing order.
    /// Returns how many columns were added.
    pub fn migrate(&mut self, additions: impl IntoIterator<Item = ColumnDef>) -> usize {
        let mut added = 0;
        for column in additions {
            if !self.contains(&column.name) {
                self.columns.push(column);
                added += 1;
            }
        }
        added
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Tickets,
    Chats,
    #[default]
    Generic,
}

impl TableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TableKind::Tickets => "tickets",
            TableKind::Chats => "chats",
            TableKind::Generic => "generic",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one logical table lives and which columns carry the key and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Logical name, also written to the `Data_Type` column.
    pub name: String,
    /// Remote tab title.
    pub tab: String,
    pub kind: TableKind,
    pub key_column: Option<String>,
    pub timestamp_column: String,
}

/// Picks a likely key column by name. Mirrors what people name ID columns in
/// ticket and chat exports.
pub fn detect_key_column<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<usize> {
    let names: Vec<String> = names.into_iter().map(|n| n.trim().to_lowercase()).collect();
    let exact = names
        .iter()
        .position(|n| n == "id" || n.ends_with(" id") || n.ends_with("_id"));
    exact.or_else(|| names.iter().position(|n| n.contains("id")))
}
