//! Descriptor-driven mapping of raw staging batches onto a domain's canonical schema.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, SubsecRound};
use lake_adapters::RawBatch;
use lake_core::{ColumnSpec, Dataset, DomainSchema, FieldType, Fill, Value, MISSING};
use tracing::debug;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
];
const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M", "%I:%M %p", "%I:%M:%S %p"];

/// Staged rows of one file after normalization, tagged with their storage path.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub path: String,
    pub rows: Dataset,
    /// Non-blank cells that failed to parse and were replaced by the fill default.
    pub unparseable_cells: usize,
}

pub struct SchemaNormalizer<'a> {
    schema: &'a DomainSchema,
}

impl<'a> SchemaNormalizer<'a> {
    pub fn new(schema: &'a DomainSchema) -> Self {
        Self { schema }
    }

    pub fn normalize(&self, batch: &RawBatch) -> NormalizedBatch {
        let sources: Vec<Option<usize>> = self
            .schema
            .columns
            .iter()
            .map(|spec| batch.column_index(&spec.source))
            .collect();

        let dropped = batch
            .header
            .iter()
            .filter(|h| !self.schema.columns.iter().any(|spec| &spec.source == *h))
            .count();
        let absent = sources.iter().filter(|s| s.is_none()).count();
        if dropped > 0 || absent > 0 {
            debug!(
                domain = %self.schema.domain_id,
                path = %batch.path,
                dropped,
                absent,
                "schema drift narrowed"
            );
        }

        let mut unparseable_cells = 0usize;
        let columns = self.schema.canonical_columns();
        let mut dataset = Dataset::empty(columns.clone());
        for row in 0..batch.len() {
            let mut values: Vec<Value> = self
                .schema
                .columns
                .iter()
                .zip(&sources)
                .map(|(spec, source)| {
                    let raw = source.and_then(|idx| batch.cell(row, idx));
                    let value = coerce(spec, raw);
                    if raw.is_some() && value.is_null() {
                        unparseable_cells += 1;
                    }
                    apply_fill(spec, value)
                })
                .collect();
            for derived in &self.schema.derived {
                let value = derived.evaluate(|name| {
                    columns
                        .iter()
                        .position(|c| c.name == name)
                        .and_then(|idx| values.get(idx))
                });
                values.push(value);
            }
            dataset.push_row(values);
        }

        NormalizedBatch {
            path: batch.path.clone(),
            rows: dataset,
            unparseable_cells,
        }
    }
}

/// Parse-or-null coercion of one raw cell.
pub fn coerce(spec: &ColumnSpec, raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let format = spec.format.as_deref();
    let parsed = match spec.field_type {
        FieldType::Text => {
            let replaced = spec.replace.get(raw).map(String::as_str).unwrap_or(raw);
            let text = if spec.capitalize {
                capitalize(replaced)
            } else {
                replaced.to_string()
            };
            Some(Value::Text(text))
        }
        FieldType::Int => parse_int(raw).map(Value::Int),
        FieldType::Float => parse_float(raw).map(Value::Float),
        FieldType::Date => parse_date(raw.trim(), format).map(Value::Date),
        // History stores microseconds; finer digits are dropped here so reruns compare equal.
        FieldType::DateTime => parse_datetime(raw.trim(), format)
            .map(|dt| Value::DateTime(dt.trunc_subsecs(6))),
        FieldType::Time => parse_time(raw.trim(), format).map(|t| Value::Time(t.trunc_subsecs(6))),
    };
    parsed.unwrap_or(Value::Null)
}

fn apply_fill(spec: &ColumnSpec, value: Value) -> Value {
    if !value.is_null() {
        return value;
    }
    match (spec.effective_fill(), spec.field_type) {
        (Fill::Missing, _) => Value::Text(MISSING.to_string()),
        (Fill::Zero, FieldType::Float) => Value::Float(0.0),
        (Fill::Zero, _) => Value::Int(0),
        (Fill::Null, _) => Value::Null,
    }
}

/// First character upper-cased, the remainder lower-cased.
pub fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let v = parse_float(raw)?;
    let integral = v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64;
    integral.then_some(v as i64)
}

fn parse_float(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_date(raw: &str, format: Option<&str>) -> Option<NaiveDate> {
    if let Some(format) = format {
        return NaiveDate::parse_from_str(raw, format)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(raw, format).ok().map(|dt| dt.date()));
    }
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .or_else(|| parse_datetime(raw, None).map(|dt| dt.date()))
}

fn parse_datetime(raw: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    if let Some(format) = format {
        return NaiveDateTime::parse_from_str(raw, format).ok();
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_time(raw: &str, format: Option<&str>) -> Option<NaiveTime> {
    if let Some(format) = format {
        return NaiveTime::parse_from_str(raw, format).ok();
    }
    TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(raw, f).ok())
        .or_else(|| parse_datetime(raw, None).map(|dt| dt.time()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lake_core::{DedupPolicy, DerivedColumn, HourBucket, StagingFormat};

    use super::*;

    fn spec(source: &str, name: &str, field_type: FieldType) -> ColumnSpec {
        ColumnSpec::new(source, name, field_type)
    }

    fn guests_schema() -> DomainSchema {
        let mut first_name = spec("employeeFirstName", "employee_first_name", FieldType::Text);
        first_name.capitalize = true;
        let mut date = spec("openBusinessDate", "date", FieldType::Date);
        date.format = Some("%Y-%m-%d".into());
        DomainSchema {
            domain_id: "oracle_guests".into(),
            enabled: true,
            staging_prefix: "oracle/Guest".into(),
            bronze_path: "oracle/guests.parquet".into(),
            format: StagingFormat::Csv { delimiter: ';' },
            columns: vec![
                date,
                spec("guestCheckID", "guest_check_id", FieldType::Int),
                spec("checkTotal", "check_total", FieldType::Float),
                first_name,
            ],
            derived: Vec::new(),
            dedup: DedupPolicy::Temporal {
                date_column: "date".into(),
                row_key: vec!["guest_check_id".into()],
            },
        }
    }

    fn raw(header: &[&str], rows: &[&[Option<&str>]]) -> RawBatch {
        RawBatch {
            path: "oracle/Guest_1.csv".into(),
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.map(str::to_string)).collect())
                .collect(),
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn renames_coerces_fills_and_capitalizes() {
        let schema = guests_schema();
        let batch = raw(
            &["openBusinessDate", "guestCheckID", "checkTotal", "employeeFirstName", "extraDrift"],
            &[
                &[Some("2023-01-01"), Some("17"), Some("12.5"), Some("mARIO"), Some("x")],
                &[Some("not-a-date"), Some("18.0"), None, None, Some("y")],
            ],
        );

        let normalized = SchemaNormalizer::new(&schema).normalize(&batch);
        let rows = normalized.rows.rows();
        assert_eq!(normalized.rows.columns().len(), 4);
        assert_eq!(
            rows[0],
            vec![
                Value::Date(d(2023, 1, 1)),
                Value::Int(17),
                Value::Float(12.5),
                Value::Text("Mario".into()),
            ]
        );
        assert_eq!(
            rows[1],
            vec![
                Value::Null,
                Value::Int(18),
                Value::Float(0.0),
                Value::Text(MISSING.into()),
            ]
        );
        assert_eq!(normalized.unparseable_cells, 1);
    }

    #[test]
    fn absent_source_columns_are_filled_not_rejected() {
        let schema = guests_schema();
        let batch = raw(&["openBusinessDate"], &[&[Some("2023-01-03")]]);
        let normalized = SchemaNormalizer::new(&schema).normalize(&batch);
        assert_eq!(
            normalized.rows.rows()[0],
            vec![
                Value::Date(d(2023, 1, 3)),
                Value::Int(0),
                Value::Float(0.0),
                Value::Text(MISSING.into()),
            ]
        );
    }

    #[test]
    fn one_source_can_feed_several_canonical_columns() {
        let mut schema = guests_schema();
        let mut alias = spec("openBusinessDate", "reservation_date", FieldType::Date);
        alias.format = Some("%Y-%m-%d".into());
        schema.columns.push(alias);
        let batch = raw(&["openBusinessDate"], &[&[Some("2023-02-01")]]);
        let normalized = SchemaNormalizer::new(&schema).normalize(&batch);
        assert_eq!(
            normalized.rows.value(0, "reservation_date"),
            Some(&Value::Date(d(2023, 2, 1)))
        );
        assert_eq!(normalized.rows.value(0, "date"), Some(&Value::Date(d(2023, 2, 1))));
    }

    #[test]
    fn replacement_runs_before_capitalization() {
        let mut shift = spec("Shift Name", "shift_name", FieldType::Text);
        shift.replace = BTreeMap::from([("DINNER".to_string(), "Cena".to_string())]);
        assert_eq!(coerce(&shift, Some("DINNER")), Value::Text("Cena".into()));
        assert_eq!(coerce(&shift, Some("BRUNCH")), Value::Text("BRUNCH".into()));

        shift.capitalize = true;
        assert_eq!(coerce(&shift, Some("BRUNCH")), Value::Text("Brunch".into()));
    }

    #[test]
    fn temporal_parsing_with_and_without_formats() {
        let mut compact = spec("date", "date", FieldType::Date);
        compact.format = Some("%Y%m%d".into());
        assert_eq!(coerce(&compact, Some("20230105")), Value::Date(d(2023, 1, 5)));
        assert_eq!(coerce(&compact, Some("2023-01-05")), Value::Null);

        let loose = spec("Created Date", "created_date", FieldType::Date);
        assert_eq!(
            coerce(&loose, Some("2023-01-05 18:30:00")),
            Value::Date(d(2023, 1, 5))
        );

        let stamp = spec("closeDateTime", "check_close_datetime", FieldType::DateTime);
        assert_eq!(
            coerce(&stamp, Some("2023-01-05T21:04:10")),
            Value::DateTime(d(2023, 1, 5).and_hms_opt(21, 4, 10).unwrap())
        );

        let time = spec("Updated - Local Time", "update_time", FieldType::Time);
        assert_eq!(
            coerce(&time, Some("7:45 PM")),
            Value::Time(NaiveTime::from_hms_opt(19, 45, 0).unwrap())
        );
    }

    #[test]
    fn numbers_parse_or_null() {
        let int = spec("n", "n", FieldType::Int);
        assert_eq!(coerce(&int, Some(" 42 ")), Value::Int(42));
        assert_eq!(coerce(&int, Some("42.5")), Value::Null);
        assert_eq!(coerce(&int, Some("abc")), Value::Null);
        let float = spec("f", "f", FieldType::Float);
        assert_eq!(coerce(&float, Some("inf")), Value::Null);
        assert_eq!(coerce(&float, Some("-3")), Value::Float(-3.0));
    }

    #[test]
    fn derived_columns_are_computed_after_coercion() {
        let mut schema = guests_schema();
        let mut employee = spec("employeeID", "ora_employee_id", FieldType::Int);
        employee.fill = Some(Fill::Null);
        schema.columns.push(employee);
        schema
            .columns
            .push(spec("closeDateTime", "ora_check_close_datetime", FieldType::DateTime));
        schema.derived = vec![
            DerivedColumn::HourBucket {
                name: "period_of_day".into(),
                column: "ora_check_close_datetime".into(),
                buckets: vec![HourBucket {
                    from: 7,
                    to: 17,
                    label: "Pranzo".into(),
                }],
                otherwise: Some("Cena".into()),
            },
            DerivedColumn::Concat {
                name: "shift_id".into(),
                columns: vec!["ora_employee_id".into(), "period_of_day".into()],
                separator: "//".into(),
            },
        ];
        let batch = raw(
            &["openBusinessDate", "employeeID", "closeDateTime"],
            &[
                &[Some("2023-01-01"), Some("104"), Some("2023-01-01T13:05:00")],
                &[Some("2023-01-01"), Some("104"), Some("2023-01-01T21:40:00")],
                &[Some("2023-01-01"), None, Some("2023-01-01T18:00:00")],
                &[Some("2023-01-01"), Some("7"), None],
            ],
        );

        let normalized = SchemaNormalizer::new(&schema).normalize(&batch);
        let derived: Vec<_> = (0..4)
            .map(|row| {
                (
                    normalized.rows.value(row, "period_of_day").cloned(),
                    normalized.rows.value(row, "shift_id").cloned(),
                )
            })
            .collect();
        let text = |s: &str| Some(Value::Text(s.into()));
        assert_eq!(
            derived,
            vec![
                (text("Pranzo"), text("104//Pranzo")),
                (text("Cena"), text("104//Cena")),
                (text("Cena"), Some(Value::Null)),
                (Some(Value::Null), Some(Value::Null)),
            ]
        );
        assert_eq!(normalized.rows.columns().len(), 8);
    }

    #[test]
    fn sub_microsecond_digits_are_truncated() {
        let stamp = spec("closeDateTime", "check_close_datetime", FieldType::DateTime);
        let expected = d(2023, 1, 1).and_hms_micro_opt(10, 0, 0, 123_456).unwrap();
        assert_eq!(
            coerce(&stamp, Some("2023-01-01 10:00:00.123456789")),
            Value::DateTime(expected)
        );
        assert_eq!(
            coerce(&stamp, Some("2023-01-01T10:00:00.123456999")),
            Value::DateTime(expected)
        );

        let time = spec("Updated - Local Time", "update_time", FieldType::Time);
        assert_eq!(
            coerce(&time, Some("23:59:59.999999999")),
            Value::Time(NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap())
        );
    }

    #[test]
    fn ints_at_the_i64_edge() {
        let int = spec("n", "n", FieldType::Int);
        assert_eq!(coerce(&int, Some("9223372036854775807")), Value::Int(i64::MAX));
        assert_eq!(coerce(&int, Some("9223372036854775808")), Value::Null);
        assert_eq!(coerce(&int, Some("9.3e18")), Value::Null);
        assert_eq!(coerce(&int, Some("-9223372036854775808")), Value::Int(i64::MIN));
    }

    #[test]
    fn capitalize_matches_sentence_case() {
        assert_eq!(capitalize("tAVOLO 12"), "Tavolo 12");
        assert_eq!(capitalize("élan"), "Élan");
        assert_eq!(capitalize(""), "");
    }
}
