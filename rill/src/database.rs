//! Record model and database readers.
//!
//! A database is a sequence of root records. Each record holds one value per
//! field of its class, including nested sub-records for relation fields, so
//! a whole multi-table entity is read in one step. Readers work on a
//! contiguous record range, which is the unit the parallel scans shard on,
//! and return only the fields of a [`FieldSelection`].

use std::collections::BTreeMap;
use std::io::BufRead;
use std::ops::Range;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::common::{ClassIdx, FieldIdx, FieldType};
use crate::schema::Schema;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid JSON: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: field {field} should be {expected}")]
    Shape {
        line: usize,
        field: String,
        expected: &'static str,
    },

    #[error("reader used before open")]
    NotOpen,
}

// ============================================================================
// Record Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Missing,
    Number(f64),
    Symbol(String),
    Text(String),
    TextList(Vec<String>),
    Object(Box<Record>),
    Table(Vec<Record>),
}

static MISSING: Value = Value::Missing;

/// One object of a class: a value per field position.
///
/// Positions of derived fields hold `Missing`; their value is computed by
/// [`crate::derive::field_value`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Value at a field position, `Missing` past the stored values.
    pub fn get(&self, field: FieldIdx) -> &Value {
        self.values.get(field.index()).unwrap_or(&MISSING)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Field Selection
// ============================================================================

/// The fields a scan reads, as a tree following relations.
///
/// A selected relation carries the selection of its target class; a selected
/// leaf field carries an empty one. Unselected positions read as `Missing`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelection {
    fields: BTreeMap<FieldIdx, FieldSelection>,
}

impl FieldSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects `field` and returns the selection of its sub-records.
    pub fn select(&mut self, field: FieldIdx) -> &mut FieldSelection {
        self.fields.entry(field).or_default()
    }

    pub fn contains(&self, field: FieldIdx) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy of `record` restricted to the selected fields.
    pub fn project(&self, record: &Record) -> Record {
        let len = self.fields.keys().next_back().map_or(0, |last| last.index() + 1);
        let mut values = vec![Value::Missing; len];
        for (&field, sub) in &self.fields {
            values[field.index()] = match record.get(field) {
                Value::Object(row) => Value::Object(Box::new(sub.project(row))),
                Value::Table(rows) => Value::Table(rows.iter().map(|row| sub.project(row)).collect()),
                other => other.clone(),
            };
        }
        Record::new(values)
    }
}

// ============================================================================
// Reader Interface
// ============================================================================

/// Sequential reader over a range of root records.
///
/// Usage mirrors a file scan: `open`, then `read` until `is_end`, checking
/// `is_error` after each read, then `close`.
pub trait RecordReader {
    fn open(&mut self) -> Result<(), DatabaseError>;

    fn is_end(&self) -> bool;

    /// Next record, or `None` at end of range or when the record could not be
    /// read (in which case `is_error` reports it).
    fn read(&mut self) -> Option<Record>;

    fn is_error(&self) -> bool;

    fn close(&mut self) -> Result<(), DatabaseError>;

    /// Fraction of the range consumed so far, in `[0, 1]`.
    fn percentage_read(&self) -> f64;
}

pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Root class of the records.
    fn class(&self) -> ClassIdx;

    fn record_count(&self) -> usize;

    /// Reader over `range`, clamped to `0..record_count()`, returning the
    /// `selection` of each record.
    fn reader<'a>(&'a self, range: Range<usize>, selection: &'a FieldSelection) -> Box<dyn RecordReader + Send + 'a>;
}

// ============================================================================
// In-memory Database
// ============================================================================

#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    class: ClassIdx,
    records: Vec<Record>,
}

impl MemoryDatabase {
    pub fn new(name: &str, class: ClassIdx, records: Vec<Record>) -> Self {
        Self {
            name: name.to_string(),
            class,
            records,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Reads one root record per line. Relations are nested JSON objects
    /// (one-to-one) or arrays of objects (one-to-many); keys not in the
    /// schema are ignored.
    pub fn from_json_lines(
        name: &str,
        schema: &Schema,
        class: ClassIdx,
        input: impl BufRead,
    ) -> Result<Self, DatabaseError> {
        let mut records = Vec::new();
        for (i, line) in input.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let json: serde_json::Value =
                serde_json::from_str(&line).map_err(|source| DatabaseError::Json { line: i + 1, source })?;
            records.push(record_from_json(schema, class, &json, i + 1)?);
        }
        info!(
            "MemoryDatabase::from_json_lines: name={}, class={}, records={}",
            name,
            schema.class(class).name,
            records.len()
        );
        Ok(Self::new(name, class, records))
    }

    pub fn load_json_lines(path: &Path, schema: &Schema, class: ClassIdx) -> Result<Self, DatabaseError> {
        let file = std::fs::File::open(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_json_lines(&name, schema, class, std::io::BufReader::new(file))
    }
}

fn record_from_json(
    schema: &Schema,
    class: ClassIdx,
    json: &serde_json::Value,
    line: usize,
) -> Result<Record, DatabaseError> {
    let c = schema.class(class);
    let object = json.as_object().ok_or_else(|| DatabaseError::Shape {
        line,
        field: c.name.clone(),
        expected: "an object",
    })?;

    let mut values = Vec::with_capacity(c.fields.len());
    for field in &c.fields {
        let raw = match object.get(&field.name) {
            Some(raw) if field.is_stored() && !raw.is_null() => raw,
            _ => {
                values.push(Value::Missing);
                continue;
            }
        };
        let shape = |expected| DatabaseError::Shape {
            line,
            field: format!("{}.{}", c.name, field.name),
            expected,
        };
        let value = match field.ftype {
            FieldType::Numerical => Value::Number(raw.as_f64().ok_or_else(|| shape("a number"))?),
            FieldType::Categorical => match raw {
                serde_json::Value::String(s) => Value::Symbol(s.clone()),
                other => Value::Symbol(other.to_string()),
            },
            FieldType::Text => Value::Text(raw.as_str().ok_or_else(|| shape("a string"))?.to_string()),
            FieldType::TextList => {
                let items = raw.as_array().ok_or_else(|| shape("an array of strings"))?;
                let texts = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| shape("an array of strings"))?;
                Value::TextList(texts)
            }
            FieldType::Object(target) => Value::Object(Box::new(record_from_json(schema, target, raw, line)?)),
            FieldType::ObjectArray(target) => {
                let items = raw.as_array().ok_or_else(|| shape("an array of objects"))?;
                let rows = items
                    .iter()
                    .map(|item| record_from_json(schema, target, item, line))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Table(rows)
            }
        };
        values.push(value);
    }
    Ok(Record::new(values))
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> ClassIdx {
        self.class
    }

    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn reader<'a>(&'a self, range: Range<usize>, selection: &'a FieldSelection) -> Box<dyn RecordReader + Send + 'a> {
        let end = range.end.min(self.records.len());
        let start = range.start.min(end);
        Box::new(MemoryReader {
            records: &self.records[start..end],
            selection,
            position: 0,
            opened: false,
        })
    }
}

struct MemoryReader<'a> {
    records: &'a [Record],
    selection: &'a FieldSelection,
    position: usize,
    opened: bool,
}

impl RecordReader for MemoryReader<'_> {
    fn open(&mut self) -> Result<(), DatabaseError> {
        self.position = 0;
        self.opened = true;
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.position >= self.records.len()
    }

    fn read(&mut self) -> Option<Record> {
        if !self.opened {
            return None;
        }
        let record = self.selection.project(self.records.get(self.position)?);
        self.position += 1;
        Some(record)
    }

    fn is_error(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<(), DatabaseError> {
        if !self.opened {
            return Err(DatabaseError::NotOpen);
        }
        debug!("MemoryReader::close: read={}/{}", self.position, self.records.len());
        self.opened = false;
        Ok(())
    }

    fn percentage_read(&self) -> f64 {
        if self.records.is_empty() {
            1.0
        } else {
            self.position as f64 / self.records.len() as f64
        }
    }
}
