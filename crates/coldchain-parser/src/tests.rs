use std::fs;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::errors::{FieldError, ParserError};
use crate::fields::{normalize, parse_quality_score, parse_timestamp, EquipmentStatus, TemperatureUnit};
use crate::model::RawRecord;
use crate::registry::{parse_readings, SourceFormat};

fn fixture(path: &str) -> Vec<u8> {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let full_path = base.join("tests/data").join(path);
    fs::read(&full_path)
        .unwrap_or_else(|err| panic!("failed to read fixture {}: {}", full_path.display(), err))
}

#[test]
fn csv_skips_malformed_row_and_keeps_siblings() {
    let body = fixture("tenant_a.csv");
    let batch = parse_readings(SourceFormat::Csv, &body).expect("csv parse failed");

    assert_eq!(batch.total(), 3);
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.rejected[0].index, 3);
    assert!(batch.rejected[0].message.contains("temperature"));

    let first = &batch.records[0];
    assert_eq!(first.facility_code().as_deref(), Some("FAC-01"));
    assert_eq!(first.unit_code().as_deref(), Some("UNIT-A"));
}

#[test]
fn csv_empty_temperature_is_a_sensor_failure_not_a_parse_error() {
    let body = fixture("tenant_a.csv");
    let batch = parse_readings(SourceFormat::Csv, &body).expect("csv parse failed");

    let reading = normalize(&batch.records[1]).expect("normalize");
    assert_eq!(reading.temperature, None);
    assert_eq!(reading.temperature_unit, TemperatureUnit::Fahrenheit);
    assert_eq!(reading.equipment_status, EquipmentStatus::Error);
    assert_eq!(reading.quality_score, 0);
    assert_eq!(
        reading.recorded_at,
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap()
    );
}

#[test]
fn csv_missing_required_columns_rejects_whole_file() {
    let body = b"facility_id,unit_id,temperature\nFAC-01,UNIT-A,1.0\n";
    let err = parse_readings(SourceFormat::Csv, body).expect_err("missing timestamp column");
    match err {
        ParserError::MissingColumns { columns, .. } => assert_eq!(columns, vec!["timestamp"]),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn csv_accepts_aliased_headers() {
    let body = b" Facility_Code , unit_code ,temp,recorded_at\nF1,U1,4.5,2025-01-01 00:00:00\n";
    let batch = parse_readings(SourceFormat::Csv, body).expect("aliased headers");
    assert_eq!(batch.records.len(), 1);
    let reading = normalize(&batch.records[0]).expect("normalize");
    assert_eq!(reading.facility_code, "F1");
    assert_eq!(reading.unit_code, "U1");
    assert_eq!(reading.temperature, Some(4.5));
}

#[test]
fn csv_row_with_wrong_field_count_is_rejected() {
    let body = b"facility_id,unit_id,temperature,timestamp\nF1,U1,1.0\nF1,U2,2.0,2025-01-01T00:00:00Z\n";
    let batch = parse_readings(SourceFormat::Csv, body).expect("csv parse");
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.rejected[0].index, 2);
}

#[test]
fn csv_header_only_yields_empty_batch() {
    let batch = parse_readings(SourceFormat::Csv, b"facility_id,unit_id,temperature,timestamp\n")
        .expect("header only");
    assert_eq!(batch.total(), 0);

    let batch = parse_readings(SourceFormat::Csv, b"").expect("empty body");
    assert_eq!(batch.total(), 0);
}

#[test]
fn push_api_isolates_bad_entries() {
    let body = fixture("api_readings.json");
    let batch = parse_readings(SourceFormat::PushApiJson, &body).expect("json parse failed");

    assert_eq!(batch.records.len(), 2);
    let rejected: Vec<usize> = batch.rejected.iter().map(|r| r.index).collect();
    assert_eq!(rejected, vec![3, 4]);

    let ok = normalize(&batch.records[0]).expect("normalize");
    assert_eq!(ok.quality_score, 1);
    assert_eq!(ok.temperature, Some(3.4));

    let failed_sensor = normalize(&batch.records[1]).expect("normalize");
    assert_eq!(failed_sensor.temperature, None);
    assert_eq!(failed_sensor.equipment_status, EquipmentStatus::Error);
}

#[test]
fn push_api_rejects_non_object_bodies() {
    let err = parse_readings(SourceFormat::PushApiJson, b"[1,2,3]").expect_err("array body");
    assert!(matches!(err, ParserError::Validation { .. }));

    let err = parse_readings(SourceFormat::PushApiJson, b"{not json").expect_err("bad json");
    assert!(matches!(err, ParserError::Json { .. }));

    let err = parse_readings(SourceFormat::PushApiJson, br#"{"data": []}"#).expect_err("no readings");
    assert!(matches!(err, ParserError::Validation { .. }));
}

#[test]
fn timestamps_accept_offsets_and_naive_forms() {
    let expected = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
    assert_eq!(parse_timestamp("2025-03-01T10:00:00+02:00").unwrap(), expected);
    assert_eq!(parse_timestamp("2025-03-01T08:00:00Z").unwrap(), expected);
    assert_eq!(parse_timestamp("2025-03-01 08:00:00").unwrap(), expected);
    assert_eq!(parse_timestamp("2025-03-01T08:00:00.000").unwrap(), expected);
    assert!(parse_timestamp("yesterday").is_err());
}

#[test]
fn quality_scores_collapse_to_binary() {
    assert_eq!(parse_quality_score(None).unwrap(), 1);
    assert_eq!(parse_quality_score(Some(&json!(0.87))).unwrap(), 1);
    assert_eq!(parse_quality_score(Some(&json!(0.2))).unwrap(), 0);
    assert_eq!(parse_quality_score(Some(&json!("1"))).unwrap(), 1);
    assert_eq!(parse_quality_score(Some(&json!(""))).unwrap(), 1);
    assert!(parse_quality_score(Some(&json!(4))).is_err());
    assert!(parse_quality_score(Some(&json!("high"))).is_err());
}

#[test]
fn normalize_reports_missing_codes() {
    let record = RawRecord::from_pairs([("unit_id", "U1"), ("timestamp", "2025-01-01T00:00:00Z")]);
    assert_eq!(normalize(&record), Err(FieldError::Missing("facility_id")));
}

#[test]
fn numeric_codes_are_rendered_as_text() {
    let record = RawRecord::from_pairs([
        ("facility_id", json!(12)),
        ("unit_id", json!("7")),
        ("temperature", json!("2.5")),
        ("timestamp", json!("2025-01-01T00:00:00Z")),
    ]);
    let reading = normalize(&record).expect("normalize");
    assert_eq!(reading.facility_code, "12");
    assert_eq!(reading.temperature, Some(2.5));
}

#[test]
fn status_and_unit_labels_convert_directly() {
    assert_eq!(EquipmentStatus::try_from(" Offline "), Ok(EquipmentStatus::Error));
    assert_eq!(EquipmentStatus::try_from("ok"), Ok(EquipmentStatus::Normal));
    let err = EquipmentStatus::try_from("melting").unwrap_err();
    assert!(err.contains("melting"));

    assert_eq!(TemperatureUnit::try_from("°F"), Ok(TemperatureUnit::Fahrenheit));
    assert!(TemperatureUnit::try_from("rankine").is_err());
}
