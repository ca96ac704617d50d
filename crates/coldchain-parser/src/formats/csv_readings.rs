use std::collections::HashMap;

use csv::{ReaderBuilder, StringRecord, Trim};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::errors::{ParserError, RejectedRecord};
use crate::fields::normalize;
use crate::model::{ParsedBatch, RawRecord};
use crate::registry::ReadingsParser;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Columns every tenant CSV must carry (after alias resolution).
pub const REQUIRED_CSV_COLUMNS: &[&str] = &["facility_id", "unit_id", "temperature", "timestamp"];

/// Header spellings seen in tenant exports, mapped to the canonical column.
static COLUMN_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("facility_code", "facility_id"),
        ("unit_code", "unit_id"),
        ("temp", "temperature"),
        ("recorded_at", "timestamp"),
        ("reading_time", "timestamp"),
    ])
});

pub struct CsvReadingsParser;

impl CsvReadingsParser {
    const NAME: &'static str = "CSV_READINGS";

    fn header_names(headers: &StringRecord) -> Vec<String> {
        headers
            .iter()
            .map(|name| name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
            .collect()
    }

    fn check_required(headers: &[String]) -> Result<(), ParserError> {
        let missing: Vec<&'static str> = REQUIRED_CSV_COLUMNS
            .iter()
            .copied()
            .filter(|required| {
                !headers.iter().any(|header| {
                    header == required
                        || COLUMN_ALIASES
                            .get(header.as_str())
                            .is_some_and(|canonical| canonical == required)
                })
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ParserError::MissingColumns {
                parser: Self::NAME,
                columns: missing,
            })
        }
    }

    fn row_to_record(headers: &[String], row: &StringRecord) -> RawRecord {
        let mut fields = Map::with_capacity(headers.len());
        for (header, value) in headers.iter().zip(row.iter()) {
            if header.is_empty() {
                continue;
            }
            fields.insert(header.clone(), Value::String(value.trim().to_string()));
        }
        RawRecord::new(fields)
    }
}

impl ReadingsParser for CsvReadingsParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(&self, body: &[u8]) -> Result<ParsedBatch, ParserError> {
        let body = body.strip_prefix(UTF8_BOM).unwrap_or(body);
        let mut batch = ParsedBatch::default();
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(batch);
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(Trim::All)
            .from_reader(body);

        let headers = reader
            .headers()
            .map_err(|err| ParserError::InvalidHeader {
                parser: Self::NAME,
                message: err.to_string(),
            })?;
        let headers = Self::header_names(headers);
        Self::check_required(&headers)?;

        for (row_index, result) in reader.records().enumerate() {
            // Header occupies line 1.
            let fallback_line = row_index + 2;
            let row = match result {
                Ok(row) => row,
                Err(err) => {
                    let line = err
                        .position()
                        .map(|pos| pos.line() as usize)
                        .unwrap_or(fallback_line);
                    batch.rejected.push(RejectedRecord::new(line, err.to_string()));
                    continue;
                }
            };

            let line = row
                .position()
                .map(|pos| pos.line() as usize)
                .unwrap_or(fallback_line);
            let record = Self::row_to_record(&headers, &row);
            match normalize(&record) {
                Ok(_) => batch.records.push(record),
                Err(err) => batch.rejected.push(RejectedRecord::new(line, err.to_string())),
            }
        }

        Ok(batch)
    }
}
