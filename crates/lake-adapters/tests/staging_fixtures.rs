use std::path::Path;

use lake_adapters::{BatchDecoder, BatchError, CsvDecoder};

fn fixture(relative: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/staging")
        .join(relative);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn google_analytics_export_decodes() {
    let decoder = CsvDecoder::new(',');
    let batch = decoder
        .decode("googleanalytics/ga_20230101.csv", &fixture("googleanalytics/ga_20230101.csv"))
        .unwrap();

    assert_eq!(batch.header, vec!["date", "source", "channelGrouping", "sessions", "users"]);
    assert_eq!(batch.len(), 4);
    let channel = batch.column_index("channelGrouping").unwrap();
    let users = batch.column_index("users").unwrap();
    assert_eq!(batch.cell(1, channel), Some("Direct"));
    assert_eq!(batch.cell(3, channel), None);
    assert_eq!(batch.cell(3, users), None);
}

#[test]
fn oracle_guest_export_uses_semicolons() {
    let decoder = CsvDecoder::new(';');
    let batch = decoder
        .decode("oracle/Guest_20230101.csv", &fixture("oracle/Guest_20230101.csv"))
        .unwrap();

    assert_eq!(batch.header.len(), 27);
    assert_eq!(batch.len(), 2);
    let table = batch.column_index("tableReference").unwrap();
    let status = batch.column_index("transferStatus").unwrap();
    assert_eq!(batch.cell(0, table), Some("TAVOLO 12"));
    assert_eq!(batch.cell(0, status), None);
    assert_eq!(batch.cell(1, status), Some("TRANSFERRED"));
}

#[test]
fn empty_oracle_export_is_rejected() {
    let decoder = CsvDecoder::new(';');
    let err = decoder
        .decode("oracle/Discount_20230101.csv", &fixture("oracle/Discount_20230101.csv"))
        .unwrap_err();
    assert!(matches!(err, BatchError::Empty { .. }));
    assert_eq!(err.path(), "oracle/Discount_20230101.csv");
}
