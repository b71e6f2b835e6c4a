//! Staging file adapters: decode raw delimited-text and Parquet extracts into string batches.

use std::sync::Arc;

use arrow_array::{Array, ArrayRef};
use arrow_cast::cast;
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_schema::DataType;
use bytes::Bytes;
use lake_core::{DomainSchema, StagingFormat};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lake-adapters";

/// Cell tokens read as absent, in addition to blank cells.
const NULL_TOKENS: &[&str] = &["NA", "N/A", "NaN", "nan", "NULL", "null", "None", "#N/A"];

/// One decoded staging file: header plus string cells, `None` for absent values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    pub path: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawBatch {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .and_then(|c| c.as_deref())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{path}: staging file has no data rows")]
    Empty { path: String },
    #[error("{path}: malformed delimited text: {message}")]
    MalformedCsv { path: String, message: String },
    #[error("{path}: malformed parquet: {message}")]
    MalformedParquet { path: String, message: String },
    #[error("{path}: column {column} has unsupported type {data_type}")]
    UnsupportedColumn {
        path: String,
        column: String,
        data_type: String,
    },
}

impl BatchError {
    pub fn path(&self) -> &str {
        match self {
            BatchError::Empty { path }
            | BatchError::MalformedCsv { path, .. }
            | BatchError::MalformedParquet { path, .. }
            | BatchError::UnsupportedColumn { path, .. } => path,
        }
    }
}

pub trait BatchDecoder: Send + Sync {
    fn format_name(&self) -> &'static str;
    fn decode(&self, path: &str, bytes: &[u8]) -> Result<RawBatch, BatchError>;
}

/// Decoder for a domain's staging format, reading only the source columns it maps.
pub fn decoder_for(schema: &DomainSchema) -> Box<dyn BatchDecoder> {
    match &schema.format {
        StagingFormat::Csv { delimiter } => Box::new(CsvDecoder::new(*delimiter)),
        StagingFormat::Parquet => Box::new(ParquetDecoder::projected(
            schema.columns.iter().map(|c| c.source.clone()),
        )),
    }
}

/// Stable id for one staged file version, so reruns over the same bytes report the same batch.
pub fn batch_id(domain_id: &str, path: &str, content_hash: &str) -> Uuid {
    let source = format!("{domain_id}:{path}:{content_hash}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

fn null_if_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || NULL_TOKENS.contains(&trimmed) {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CsvDecoder {
    delimiter: u8,
}

impl CsvDecoder {
    /// Non-ASCII delimiters are rejected by domain validation; fall back to a comma here.
    pub fn new(delimiter: char) -> Self {
        let delimiter = if delimiter.is_ascii() { delimiter as u8 } else { b',' };
        Self { delimiter }
    }
}

impl BatchDecoder for CsvDecoder {
    fn format_name(&self) -> &'static str {
        "csv"
    }

    fn decode(&self, path: &str, bytes: &[u8]) -> Result<RawBatch, BatchError> {
        let malformed = |message: String| BatchError::MalformedCsv {
            path: path.to_string(),
            message,
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(BatchError::Empty {
                path: path.to_string(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(bytes);

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| malformed(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if header.iter().all(String::is_empty) {
            return Err(BatchError::Empty {
                path: path.to_string(),
            });
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| malformed(e.to_string()))?;
            rows.push(record.iter().map(null_if_blank).collect());
        }

        if rows.is_empty() {
            return Err(BatchError::Empty {
                path: path.to_string(),
            });
        }

        Ok(RawBatch {
            path: path.to_string(),
            header,
            rows,
        })
    }
}

/// Decodes Parquet extracts. With a projection, only the named columns are read, so
/// columns a domain never maps cannot fail the file.
#[derive(Debug, Clone, Default)]
pub struct ParquetDecoder {
    columns: Option<Vec<String>>,
}

impl ParquetDecoder {
    pub fn projected<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
        }
    }
}

impl BatchDecoder for ParquetDecoder {
    fn format_name(&self) -> &'static str {
        "parquet"
    }

    fn decode(&self, path: &str, bytes: &[u8]) -> Result<RawBatch, BatchError> {
        let malformed = |message: String| BatchError::MalformedParquet {
            path: path.to_string(),
            message,
        };

        if bytes.is_empty() {
            return Err(BatchError::Empty {
                path: path.to_string(),
            });
        }

        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes))
            .map_err(|e| malformed(format!("reader init failed: {e}")))?;
        let total_rows = usize::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);
        let roots: Vec<usize> = builder
            .schema()
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| match &self.columns {
                Some(wanted) => wanted.iter().any(|w| w == f.name()),
                None => true,
            })
            .map(|(i, _)| i)
            .collect();
        let header: Vec<String> = roots
            .iter()
            .map(|&i| builder.schema().field(i).name().clone())
            .collect();

        if header.is_empty() {
            // Nothing mapped is present; every row reads as absent cells.
            if total_rows == 0 {
                return Err(BatchError::Empty {
                    path: path.to_string(),
                });
            }
            return Ok(RawBatch {
                path: path.to_string(),
                header,
                rows: vec![Vec::new(); total_rows],
            });
        }

        let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
        let reader = builder
            .with_projection(mask)
            .build()
            .map_err(|e| malformed(format!("reader build failed: {e}")))?;

        let mut rows = Vec::with_capacity(total_rows);
        for batch in reader {
            let batch = batch.map_err(|e| malformed(format!("read batch failed: {e}")))?;
            let columns = batch
                .columns()
                .iter()
                .zip(&header)
                .map(|(array, name)| column_cells(path, name, array))
                .collect::<Result<Vec<_>, _>>()?;
            for row in 0..batch.num_rows() {
                rows.push(columns.iter().map(|c| c[row].clone()).collect());
            }
        }

        if rows.is_empty() {
            return Err(BatchError::Empty {
                path: path.to_string(),
            });
        }

        Ok(RawBatch {
            path: path.to_string(),
            header,
            rows,
        })
    }
}

/// Renders any displayable arrow column as text cells. Booleans become `1`/`0` and
/// zoned timestamps drop their zone so the normalizer sees plain numbers and datetimes.
fn column_cells(path: &str, name: &str, array: &ArrayRef) -> Result<Vec<Option<String>>, BatchError> {
    let unsupported = || BatchError::UnsupportedColumn {
        path: path.to_string(),
        column: name.to_string(),
        data_type: array.data_type().to_string(),
    };

    let plain = match array.data_type() {
        DataType::Null => return Ok(vec![None; array.len()]),
        DataType::Boolean => cast(array, &DataType::Int8).map_err(|_| unsupported())?,
        DataType::Timestamp(unit, Some(_)) => {
            cast(array, &DataType::Timestamp(*unit, None)).map_err(|_| unsupported())?
        }
        _ => Arc::clone(array),
    };

    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(plain.as_ref(), &options).map_err(|_| unsupported())?;
    Ok((0..plain.len())
        .map(|i| {
            if plain.is_null(i) {
                None
            } else {
                null_if_blank(&formatter.value(i).to_string())
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{
        BooleanArray, Date32Array, DictionaryArray, Float64Array, Int16Array, Int64Array,
        RecordBatch, StringArray, TimestampNanosecondArray, UInt32Array,
    };
    use arrow_array::types::Int32Type;
    use arrow_schema::{Field, Schema, TimeUnit};
    use parquet::arrow::ArrowWriter;

    use super::*;

    fn parquet_bytes(batch: RecordBatch) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        buf
    }

    #[test]
    fn csv_decoder_honours_delimiter_and_blank_cells() {
        let decoder = CsvDecoder::new(';');
        let batch = decoder
            .decode(
                "oracle/Guest_1.csv",
                b"openBusinessDate;guestCheckID;tableReference\n2023-01-01;17;\n2023-01-02;NaN;t4\n",
            )
            .expect("decode");
        assert_eq!(batch.header, vec!["openBusinessDate", "guestCheckID", "tableReference"]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.cell(0, 1), Some("17"));
        assert_eq!(batch.cell(0, 2), None);
        assert_eq!(batch.cell(1, 1), None);
        assert_eq!(batch.cell(1, 2), Some("t4"));
    }

    #[test]
    fn empty_and_header_only_csv_are_rejected_as_empty() {
        let decoder = CsvDecoder::new(',');
        assert!(matches!(
            decoder.decode("ga/empty.csv", b""),
            Err(BatchError::Empty { .. })
        ));
        assert!(matches!(
            decoder.decode("ga/blank.csv", b"  \n\n"),
            Err(BatchError::Empty { .. })
        ));
        assert!(matches!(
            decoder.decode("ga/header.csv", b"date,sessions\n"),
            Err(BatchError::Empty { .. })
        ));
    }

    #[test]
    fn ragged_csv_is_malformed() {
        let err = CsvDecoder::new(',')
            .decode("ga/ragged.csv", b"date,sessions\n20230101,4,extra\n")
            .expect_err("ragged");
        assert!(matches!(err, BatchError::MalformedCsv { .. }));
        assert_eq!(err.path(), "ga/ragged.csv");
    }

    #[test]
    fn parquet_decoder_renders_typed_columns_as_text() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("Confirmation #", DataType::Utf8, true),
            Field::new("Booked Covers", DataType::Int64, true),
            Field::new("Reservation Date", DataType::Date32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("ABC1"), Some("")])),
                Arc::new(Int64Array::from(vec![Some(4), None])),
                Arc::new(Date32Array::from(vec![Some(19358), None])),
            ],
        )
        .unwrap();

        let raw = ParquetDecoder::default()
            .decode("sevenrooms/yesterday/a.parquet", &parquet_bytes(batch))
            .expect("decode");
        assert_eq!(raw.header[0], "Confirmation #");
        assert_eq!(
            raw.rows[0],
            vec![Some("ABC1".into()), Some("4".into()), Some("2023-01-01".into())]
        );
        assert_eq!(raw.rows[1], vec![None, None, None]);
    }

    #[test]
    fn projection_skips_unmapped_columns_of_any_type() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("Confirmation #", DataType::Utf8, true),
            Field::new("Party Size Bucket", DataType::Int16, true),
            Field::new("Venue Id", DataType::UInt32, true),
            Field::new(
                "Tags",
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
                true,
            ),
            Field::new("Booked Covers", DataType::Int64, true),
        ]));
        let tags: DictionaryArray<Int32Type> = vec![Some("vip"), None].into_iter().collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("ABC1"), Some("ABC2")])),
                Arc::new(Int16Array::from(vec![Some(2), Some(3)])),
                Arc::new(UInt32Array::from(vec![Some(7), Some(7)])),
                Arc::new(tags),
                Arc::new(Int64Array::from(vec![Some(4), Some(6)])),
            ],
        )
        .unwrap();

        let raw = ParquetDecoder::projected(["Confirmation #", "Booked Covers", "Not There"])
            .decode("sevenrooms/yesterday/wide.parquet", &parquet_bytes(batch))
            .expect("decode");
        assert_eq!(raw.header, vec!["Confirmation #", "Booked Covers"]);
        assert_eq!(raw.rows[0], vec![Some("ABC1".into()), Some("4".into())]);
        assert_eq!(raw.rows[1], vec![Some("ABC2".into()), Some("6".into())]);
    }

    #[test]
    fn wide_arrow_types_render_as_text() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("flag", DataType::Boolean, true),
            Field::new("small", DataType::Int16, true),
            Field::new("ratio", DataType::Float64, true),
            Field::new(
                "at",
                DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
                true,
            ),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(BooleanArray::from(vec![Some(true), None])),
                Arc::new(Int16Array::from(vec![Some(-3), None])),
                Arc::new(Float64Array::from(vec![Some(f64::NAN), Some(1.5)])),
                Arc::new(
                    TimestampNanosecondArray::from(vec![Some(1_672_567_200_123_456_789), None])
                        .with_timezone("UTC"),
                ),
            ],
        )
        .unwrap();

        let raw = ParquetDecoder::default()
            .decode("sevenrooms/yesterday/types.parquet", &parquet_bytes(batch))
            .expect("decode");
        assert_eq!(
            raw.rows[0],
            vec![
                Some("1".into()),
                Some("-3".into()),
                None,
                Some("2023-01-01T10:00:00.123456789".into()),
            ]
        );
        assert_eq!(raw.rows[1], vec![None, None, Some("1.5".into()), None]);
    }

    #[test]
    fn projection_with_no_mapped_columns_keeps_row_count() {
        let schema = Arc::new(Schema::new(vec![Field::new("other", DataType::Int16, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int16Array::from(vec![Some(1), Some(2), Some(3)]))],
        )
        .unwrap();

        let raw = ParquetDecoder::projected(["Confirmation #"])
            .decode("sevenrooms/yesterday/none.parquet", &parquet_bytes(batch))
            .expect("decode");
        assert!(raw.header.is_empty());
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn garbage_bytes_are_malformed_parquet() {
        let err = ParquetDecoder::default()
            .decode("sevenrooms/yesterday/bad.parquet", b"definitely not parquet")
            .expect_err("garbage");
        assert!(matches!(err, BatchError::MalformedParquet { .. }));
    }

    #[test]
    fn batch_ids_are_deterministic_per_content() {
        let a = batch_id("ga", "ga/1.csv", "abc");
        assert_eq!(a, batch_id("ga", "ga/1.csv", "abc"));
        assert_ne!(a, batch_id("ga", "ga/1.csv", "abd"));
    }
}
