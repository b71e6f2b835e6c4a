//! Bronze history persistence: one Parquet object per domain, replaced atomically.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{
    Array, ArrayRef, Date32Array, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeStringArray, RecordBatch, StringArray, Time64MicrosecondArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use lake_core::{Column, Dataset, DomainSchema, FieldType, Value};
use lake_storage::{ObjectStore, Tier};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tracing::{info, warn};

/// Proof that a domain's history was durably replaced. Only [`HistoryStore::save`]
/// creates one, and staging cleanup requires it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedHistory {
    pub domain_id: String,
    pub path: String,
    pub content_hash: String,
    pub rows: usize,
    _sealed: (),
}

pub struct HistoryStore {
    store: Arc<dyn ObjectStore>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Persisted history, or an empty dataset with the canonical schema on cold start.
    pub async fn load(&self, schema: &DomainSchema) -> Result<Dataset> {
        let bytes = match self.store.get(Tier::Bronze, &schema.bronze_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                info!(domain = %schema.domain_id, "no history yet; cold start");
                return Ok(Dataset::empty(schema.canonical_columns()));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("loading history for {}", schema.domain_id))
            }
        };
        decode_history(schema, Bytes::from(bytes))
            .with_context(|| format!("decoding history {}", schema.bronze_path))
    }

    pub async fn save(&self, schema: &DomainSchema, history: &Dataset) -> Result<CommittedHistory> {
        let bytes = encode_history(history)
            .with_context(|| format!("encoding history for {}", schema.domain_id))?;
        let stored = self
            .store
            .put(Tier::Bronze, &schema.bronze_path, &bytes)
            .await
            .with_context(|| format!("saving history for {}", schema.domain_id))?;
        Ok(CommittedHistory {
            domain_id: schema.domain_id.clone(),
            path: stored.path,
            content_hash: stored.content_hash,
            rows: history.len(),
            _sealed: (),
        })
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Date => DataType::Date32,
        FieldType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
        FieldType::Time => DataType::Time64(TimeUnit::Microsecond),
        FieldType::Int => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Text => DataType::Utf8,
    }
}

fn time_micros(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * 1_000_000 + i64::from(t.nanosecond() / 1_000)
}

fn encode_column(rows: &[Vec<Value>], idx: usize, field_type: FieldType) -> ArrayRef {
    let cells = rows.iter().map(|r| &r[idx]);
    match field_type {
        FieldType::Int => Arc::new(Int64Array::from_iter(cells.map(|v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        }))),
        FieldType::Float => Arc::new(Float64Array::from_iter(cells.map(|v| match v {
            Value::Float(f) => Some(*f),
            _ => None,
        }))),
        FieldType::Text => Arc::new(StringArray::from_iter(cells.map(|v| v.as_text()))),
        FieldType::Date => Arc::new(Date32Array::from_iter(cells.map(|v| match v {
            Value::Date(d) => i32::try_from((*d - epoch()).num_days()).ok(),
            _ => None,
        }))),
        FieldType::DateTime => Arc::new(TimestampMicrosecondArray::from_iter(cells.map(
            |v| match v {
                Value::DateTime(dt) => Some(dt.and_utc().timestamp_micros()),
                _ => None,
            },
        ))),
        FieldType::Time => Arc::new(Time64MicrosecondArray::from_iter(cells.map(|v| match v {
            Value::Time(t) => Some(time_micros(*t)),
            _ => None,
        }))),
    }
}

pub fn encode_history(history: &Dataset) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(
        history
            .columns()
            .iter()
            .map(|c| ArrowField::new(c.name.clone(), arrow_type(c.field_type), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = history
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, c)| encode_column(history.rows(), idx, c.field_type))
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building history record batch")?;

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing history record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

pub fn decode_history(schema: &DomainSchema, bytes: Bytes) -> Result<Dataset> {
    let columns = schema.canonical_columns();
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(bytes).context("parquet reader init failed")?;
    let stored: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    // Mapped columns must be stored; derived ones are recomputed when absent.
    let mapped = schema.columns.len();
    let positions = columns
        .iter()
        .enumerate()
        .map(|(idx, c)| match stored.iter().position(|name| name == &c.name) {
            Some(pos) => Ok(Some(pos)),
            None if idx >= mapped => Ok(None),
            None => bail!("history is missing canonical column {}", c.name),
        })
        .collect::<Result<Vec<_>>>()?;
    let backfilled = positions[mapped..].iter().filter(|p| p.is_none()).count();
    if backfilled > 0 {
        info!(domain = %schema.domain_id, backfilled, "recomputing derived columns absent from history");
    }
    let extra: Vec<_> = stored
        .iter()
        .filter(|name| !columns.iter().any(|c| &c.name == *name))
        .collect();
    if !extra.is_empty() {
        warn!(domain = %schema.domain_id, ?extra, "history carries non-canonical columns; dropping them");
    }

    let reader = builder.build().context("parquet reader build failed")?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("reading history batch")?;
        let decoded = columns
            .iter()
            .zip(&positions)
            .map(|(column, pos)| match pos {
                Some(pos) => decode_column(column, batch.column(*pos)),
                None => Ok(vec![Value::Null; batch.num_rows()]),
            })
            .collect::<Result<Vec<_>>>()?;
        for row in 0..batch.num_rows() {
            let mut values: Vec<Value> = decoded.iter().map(|c| c[row].clone()).collect();
            for (offset, derived) in schema.derived.iter().enumerate() {
                if positions[mapped + offset].is_some() {
                    continue;
                }
                let value = derived.evaluate(|name| {
                    columns
                        .iter()
                        .position(|c| c.name == name)
                        .and_then(|idx| values.get(idx))
                });
                values[mapped + offset] = value;
            }
            rows.push(values);
        }
    }
    Ok(Dataset::new(columns, rows))
}

fn typed<'a, T: 'static>(column: &Column, array: &'a ArrayRef) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().with_context(|| {
        format!(
            "history column {} has unexpected array type {}",
            column.name,
            array.data_type()
        )
    })
}

fn collect<A: Array, F: Fn(usize) -> Value>(array: &A, value_at: F) -> Vec<Value> {
    (0..array.len())
        .map(|i| if array.is_null(i) { Value::Null } else { value_at(i) })
        .collect()
}

fn timestamps(column: &Column, array: &ArrayRef) -> Result<Option<Vec<Option<NaiveDateTime>>>> {
    let values = match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => {
            let a = typed::<TimestampSecondArray>(column, array)?;
            (0..a.len()).map(|i| a.value_as_datetime(i)).collect()
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let a = typed::<TimestampMillisecondArray>(column, array)?;
            (0..a.len()).map(|i| a.value_as_datetime(i)).collect()
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let a = typed::<TimestampMicrosecondArray>(column, array)?;
            (0..a.len()).map(|i| a.value_as_datetime(i)).collect()
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            let a = typed::<TimestampNanosecondArray>(column, array)?;
            (0..a.len()).map(|i| a.value_as_datetime(i)).collect()
        }
        _ => return Ok(None),
    };
    Ok(Some(values))
}

fn with_nulls(array: &ArrayRef, values: Vec<Option<Value>>) -> Vec<Value> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| if array.is_null(i) { Value::Null } else { v.unwrap_or(Value::Null) })
        .collect()
}

/// Decodes one stored column; histories written by older tooling may use wider
/// or coarser Arrow types than the ones this crate writes.
fn decode_column(column: &Column, array: &ArrayRef) -> Result<Vec<Value>> {
    let values = match (column.field_type, array.data_type()) {
        (FieldType::Int, DataType::Int64) => {
            let a = typed::<Int64Array>(column, array)?;
            collect(a, |i| Value::Int(a.value(i)))
        }
        (FieldType::Int, DataType::Int32) => {
            let a = typed::<Int32Array>(column, array)?;
            collect(a, |i| Value::Int(i64::from(a.value(i))))
        }
        (FieldType::Int, DataType::Float64) => {
            let a = typed::<Float64Array>(column, array)?;
            collect(a, |i| {
                let v = a.value(i);
                if v.is_finite() && v.fract() == 0.0 {
                    Value::Int(v as i64)
                } else {
                    Value::Null
                }
            })
        }
        (FieldType::Float, DataType::Float64) => {
            let a = typed::<Float64Array>(column, array)?;
            collect(a, |i| Value::Float(a.value(i)))
        }
        (FieldType::Float, DataType::Float32) => {
            let a = typed::<Float32Array>(column, array)?;
            collect(a, |i| Value::Float(f64::from(a.value(i))))
        }
        (FieldType::Float, DataType::Int64) => {
            let a = typed::<Int64Array>(column, array)?;
            collect(a, |i| Value::Float(a.value(i) as f64))
        }
        (FieldType::Text, DataType::Utf8) => {
            let a = typed::<StringArray>(column, array)?;
            collect(a, |i| Value::Text(a.value(i).to_string()))
        }
        (FieldType::Text, DataType::LargeUtf8) => {
            let a = typed::<LargeStringArray>(column, array)?;
            collect(a, |i| Value::Text(a.value(i).to_string()))
        }
        (FieldType::Date, DataType::Date32) => {
            let a = typed::<Date32Array>(column, array)?;
            collect(a, |i| a.value_as_date(i).map_or(Value::Null, Value::Date))
        }
        (FieldType::DateTime, DataType::Date32) => {
            let a = typed::<Date32Array>(column, array)?;
            collect(a, |i| {
                a.value_as_date(i)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map_or(Value::Null, Value::DateTime)
            })
        }
        (FieldType::Time, DataType::Time64(TimeUnit::Microsecond)) => {
            let a = typed::<Time64MicrosecondArray>(column, array)?;
            collect(a, |i| a.value_as_time(i).map_or(Value::Null, Value::Time))
        }
        (FieldType::Date | FieldType::DateTime | FieldType::Time, DataType::Timestamp(_, _)) => {
            let stamps = timestamps(column, array)?
                .with_context(|| format!("history column {} is not a timestamp", column.name))?;
            let values = stamps
                .into_iter()
                .map(|ts| {
                    ts.map(|dt| match column.field_type {
                        FieldType::Date => Value::Date(dt.date()),
                        FieldType::Time => Value::Time(dt.time()),
                        _ => Value::DateTime(dt),
                    })
                })
                .collect();
            with_nulls(array, values)
        }
        (_, DataType::Null) => vec![Value::Null; array.len()],
        (field_type, data_type) => bail!(
            "history column {} is stored as {data_type}, expected {field_type:?}",
            column.name
        ),
    };
    Ok(values)
}
