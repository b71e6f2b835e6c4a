//! Canonical record model and declarative domain descriptors for the lake.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lake-core";

/// Placeholder written into categorical fields that arrived empty or unparseable.
pub const MISSING: &str = "_missing_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Date,
    DateTime,
    Time,
    Int,
    Float,
    Text,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime | FieldType::Time)
    }
}

/// One cell of a canonical record.
///
/// Values are totally ordered and hashable so they can take part in dedup keys:
/// `Null` sorts lowest, variants order by kind and floats compare with `total_cmp`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Plain text form of a non-null value, as used when joining columns.
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.to_string()),
            Value::DateTime(dt) => Some(dt.to_string()),
            Value::Time(t) => Some(t.to_string()),
        }
    }

    /// Calendar date carried by a `Date` or `DateTime` value.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            Value::DateTime(_) => 5,
            Value::Time(_) => 6,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
            Value::DateTime(v) => v.hash(state),
            Value::Time(v) => v.hash(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Row/column table of canonical values; every row has one value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn empty(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Cell lookup by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fill {
    Missing,
    Zero,
    Null,
}

/// One entry of a domain's column mapping: where the value comes from and what it becomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub source: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub fill: Option<Fill>,
    /// chrono format string for temporal columns.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub capitalize: bool,
    #[serde(default)]
    pub replace: BTreeMap<String, String>,
}

impl ColumnSpec {
    pub fn new(source: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            field_type,
            fill: None,
            format: None,
            capitalize: false,
            replace: BTreeMap::new(),
        }
    }

    pub fn effective_fill(&self) -> Fill {
        self.fill.unwrap_or(match self.field_type {
            FieldType::Text => Fill::Missing,
            FieldType::Int | FieldType::Float => Fill::Zero,
            FieldType::Date | FieldType::DateTime | FieldType::Time => Fill::Null,
        })
    }
}

/// Inclusive range of clock hours that share one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourBucket {
    pub from: u32,
    pub to: u32,
    pub label: String,
}

/// A text column computed from already-coerced columns of the same row.
///
/// Derived columns are appended after the mapped ones, in declaration order, and
/// may read mapped columns or derived columns declared before them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "derive", rename_all = "snake_case")]
pub enum DerivedColumn {
    /// Labels the clock hour of a `date_time` or `time` column.
    HourBucket {
        name: String,
        column: String,
        buckets: Vec<HourBucket>,
        /// Label for hours no bucket covers; null when unset.
        #[serde(default)]
        otherwise: Option<String>,
    },
    /// Joins the text form of `columns`; null as soon as one input is null.
    Concat {
        name: String,
        columns: Vec<String>,
        #[serde(default)]
        separator: String,
    },
}

impl DerivedColumn {
    pub fn name(&self) -> &str {
        match self {
            DerivedColumn::HourBucket { name, .. } | DerivedColumn::Concat { name, .. } => name,
        }
    }

    pub fn inputs(&self) -> Vec<&str> {
        match self {
            DerivedColumn::HourBucket { column, .. } => vec![column.as_str()],
            DerivedColumn::Concat { columns, .. } => columns.iter().map(String::as_str).collect(),
        }
    }

    pub fn evaluate<'a, F>(&self, lookup: F) -> Value
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        match self {
            DerivedColumn::HourBucket {
                column,
                buckets,
                otherwise,
                ..
            } => {
                let hour = match lookup(column) {
                    Some(Value::DateTime(dt)) => dt.hour(),
                    Some(Value::Time(t)) => t.hour(),
                    _ => return Value::Null,
                };
                buckets
                    .iter()
                    .find(|b| (b.from..=b.to).contains(&hour))
                    .map(|b| b.label.clone())
                    .or_else(|| otherwise.clone())
                    .map_or(Value::Null, Value::Text)
            }
            DerivedColumn::Concat {
                columns, separator, ..
            } => columns
                .iter()
                .map(|c| lookup(c).and_then(Value::render))
                .collect::<Option<Vec<_>>>()
                .map_or(Value::Null, |parts| Value::Text(parts.join(separator))),
        }
    }
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagingFormat {
    Csv {
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    Parquet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizonKeep {
    OnOrBefore,
    After,
}

/// Rolling window applied to natural-key domains, relative to the run's reference date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    pub column: String,
    pub keep: HorizonKeep,
    #[serde(default)]
    pub offset_days: i64,
}

impl Horizon {
    pub fn cutoff(&self, reference: NaiveDate) -> NaiveDate {
        reference - Duration::days(self.offset_days)
    }

    /// Rows without a usable date fall outside every window.
    pub fn retains(&self, value: &Value, reference: NaiveDate) -> bool {
        let Some(date) = value.as_date() else {
            return false;
        };
        let cutoff = self.cutoff(reference);
        match self.keep {
            HorizonKeep::OnOrBefore => date <= cutoff,
            HorizonKeep::After => date > cutoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Append staged rows whose business date is not yet in history.
    Temporal {
        date_column: String,
        #[serde(default)]
        row_key: Vec<String>,
    },
    /// Keep the most recently updated record per natural key.
    Natural {
        key: Vec<String>,
        updated_by: Vec<String>,
        #[serde(default)]
        horizon: Option<Horizon>,
    },
}

impl DedupPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            DedupPolicy::Temporal { .. } => "temporal",
            DedupPolicy::Natural { .. } => "natural",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Declarative description of one ingestion domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSchema {
    pub domain_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub staging_prefix: String,
    pub bronze_path: String,
    pub format: StagingFormat,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub derived: Vec<DerivedColumn>,
    pub dedup: DedupPolicy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("domain {domain}: duplicate canonical column {column}")]
    DuplicateColumn { domain: String, column: String },
    #[error("domain {domain}: reference to unknown column {column}")]
    UnknownColumn { domain: String, column: String },
    #[error("domain {domain}: column {column} must be {expected}")]
    WrongType {
        domain: String,
        column: String,
        expected: &'static str,
    },
    #[error("domain {domain}: {message}")]
    Invalid { domain: String, message: String },
}

impl DomainSchema {
    /// Mapped columns followed by derived ones.
    pub fn canonical_columns(&self) -> Vec<Column> {
        self.columns
            .iter()
            .map(|spec| Column::new(spec.name.clone(), spec.field_type))
            .chain(
                self.derived
                    .iter()
                    .map(|d| Column::new(d.name().to_string(), FieldType::Text)),
            )
            .collect()
    }

    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        self.columns
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.field_type)
            .or_else(|| {
                self.derived
                    .iter()
                    .any(|d| d.name() == name)
                    .then_some(FieldType::Text)
            })
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |message: &str| SchemaError::Invalid {
            domain: self.domain_id.clone(),
            message: message.to_string(),
        };

        if self.columns.is_empty() {
            return Err(invalid("no columns declared"));
        }
        if self.staging_prefix.trim().is_empty() || self.bronze_path.trim().is_empty() {
            return Err(invalid("staging_prefix and bronze_path are required"));
        }
        if let StagingFormat::Csv { delimiter } = self.format {
            if !delimiter.is_ascii() {
                return Err(invalid("csv delimiter must be a single ASCII character"));
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.columns {
            if !seen.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    domain: self.domain_id.clone(),
                    column: spec.name.clone(),
                });
            }
            match spec.fill {
                Some(Fill::Missing) if spec.field_type != FieldType::Text => {
                    return Err(self.wrong_type(&spec.name, "text to use fill: missing"));
                }
                Some(Fill::Zero) if !spec.field_type.is_numeric() => {
                    return Err(self.wrong_type(&spec.name, "numeric to use fill: zero"));
                }
                _ => {}
            }
            if spec.format.is_some() && !spec.field_type.is_temporal() {
                return Err(invalid("format is only meaningful on temporal columns"));
            }
        }

        for derived in &self.derived {
            for input in derived.inputs() {
                let ty = seen.contains(input).then(|| self.column_type(input)).flatten();
                let Some(ty) = ty else {
                    return Err(SchemaError::UnknownColumn {
                        domain: self.domain_id.clone(),
                        column: input.to_string(),
                    });
                };
                if let DerivedColumn::HourBucket { buckets, .. } = derived {
                    if !matches!(ty, FieldType::DateTime | FieldType::Time) {
                        return Err(self.wrong_type(input, "a date_time or time"));
                    }
                    if buckets.iter().any(|b| b.from > b.to || b.to > 23) {
                        return Err(invalid("hour buckets must be ordered hours within 0..=23"));
                    }
                }
            }
            if !seen.insert(derived.name()) {
                return Err(SchemaError::DuplicateColumn {
                    domain: self.domain_id.clone(),
                    column: derived.name().to_string(),
                });
            }
        }

        match &self.dedup {
            DedupPolicy::Temporal {
                date_column,
                row_key,
            } => {
                let ty = self.require_column(date_column)?;
                if !matches!(ty, FieldType::Date | FieldType::DateTime) {
                    return Err(self.wrong_type(date_column, "a date"));
                }
                for column in row_key {
                    self.require_column(column)?;
                }
            }
            DedupPolicy::Natural {
                key,
                updated_by,
                horizon,
            } => {
                if key.is_empty() {
                    return Err(invalid("natural dedup requires at least one key column"));
                }
                for column in key.iter().chain(updated_by) {
                    self.require_column(column)?;
                }
                if let Some(horizon) = horizon {
                    let ty = self.require_column(&horizon.column)?;
                    if !matches!(ty, FieldType::Date | FieldType::DateTime) {
                        return Err(self.wrong_type(&horizon.column, "a date"));
                    }
                }
            }
        }
        Ok(())
    }

    fn require_column(&self, name: &str) -> Result<FieldType, SchemaError> {
        self.column_type(name).ok_or_else(|| SchemaError::UnknownColumn {
            domain: self.domain_id.clone(),
            column: name.to_string(),
        })
    }

    fn wrong_type(&self, column: &str, expected: &'static str) -> SchemaError {
        SchemaError::WrongType {
            domain: self.domain_id.clone(),
            column: column.to_string(),
            expected,
        }
    }
}
