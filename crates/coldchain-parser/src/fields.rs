//! Field-level normalization shared by payload validation and by the writer
//! when it turns a queued event into a persisted reading.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FieldError;
use crate::model::RawRecord;

pub const FACILITY_KEYS: &[&str] = &["facility_code", "facility_id"];
pub const UNIT_KEYS: &[&str] = &["unit_code", "unit_id"];
pub const TEMPERATURE_KEYS: &[&str] = &["temperature", "temp"];
pub const TEMPERATURE_UNIT_KEYS: &[&str] = &["temperature_unit", "degrees"];
pub const TIMESTAMP_KEYS: &[&str] = &["timestamp", "recorded_at", "reading_time"];
pub const SENSOR_KEYS: &[&str] = &["sensor_id"];
pub const QUALITY_KEYS: &[&str] = &["quality_score"];
pub const STATUS_KEYS: &[&str] = &["equipment_status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
    #[serde(rename = "K")]
    Kelvin,
}

impl TemperatureUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "C",
            TemperatureUnit::Fahrenheit => "F",
            TemperatureUnit::Kelvin => "K",
        }
    }
}

impl Default for TemperatureUnit {
    fn default() -> Self {
        TemperatureUnit::Celsius
    }
}

impl fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TemperatureUnit {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        let lowered = value.trim().trim_start_matches('°').to_ascii_lowercase();
        match lowered.as_str() {
            "c" | "celsius" | "degc" => Ok(TemperatureUnit::Celsius),
            "f" | "fahrenheit" | "degf" => Ok(TemperatureUnit::Fahrenheit),
            "k" | "kelvin" => Ok(TemperatureUnit::Kelvin),
            other => Err(format!("unknown temperature unit '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentStatus {
    Normal,
    Warning,
    Error,
}

impl EquipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentStatus::Normal => "normal",
            EquipmentStatus::Warning => "warning",
            EquipmentStatus::Error => "error",
        }
    }
}

impl Default for EquipmentStatus {
    fn default() -> Self {
        EquipmentStatus::Normal
    }
}

impl fmt::Display for EquipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for EquipmentStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" | "ok" => Ok(EquipmentStatus::Normal),
            "warning" | "maintenance" | "degraded" => Ok(EquipmentStatus::Warning),
            "error" | "failure" | "fault" | "offline" => Ok(EquipmentStatus::Error),
            other => Err(format!("unknown equipment status '{other}'")),
        }
    }
}

/// A raw record with every field checked and converted.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub facility_code: String,
    pub unit_code: String,
    /// `None` means the sensor reported no value (equipment failure).
    pub temperature: Option<f64>,
    pub temperature_unit: TemperatureUnit,
    pub recorded_at: DateTime<Utc>,
    pub sensor_id: String,
    pub quality_score: i16,
    pub equipment_status: EquipmentStatus,
}

pub fn normalize(record: &RawRecord) -> Result<NormalizedReading, FieldError> {
    let facility_code = record
        .facility_code()
        .ok_or(FieldError::Missing("facility_id"))?;
    let unit_code = record.unit_code().ok_or(FieldError::Missing("unit_id"))?;
    let temperature = parse_temperature(record.first(TEMPERATURE_KEYS))?;

    let timestamp = record
        .text(TIMESTAMP_KEYS)
        .ok_or(FieldError::Missing("timestamp"))?;
    let recorded_at = parse_timestamp(&timestamp)?;

    let temperature_unit = match record.text(TEMPERATURE_UNIT_KEYS) {
        Some(raw) => TemperatureUnit::try_from(raw.as_str())
            .map_err(|reason| FieldError::invalid("temperature_unit", raw.clone(), reason))?,
        None => TemperatureUnit::default(),
    };

    let equipment_status = match record.text(STATUS_KEYS) {
        Some(raw) => EquipmentStatus::try_from(raw.as_str())
            .map_err(|reason| FieldError::invalid("equipment_status", raw.clone(), reason))?,
        None => EquipmentStatus::default(),
    };

    Ok(NormalizedReading {
        facility_code,
        unit_code,
        temperature,
        temperature_unit,
        recorded_at,
        sensor_id: record.text(SENSOR_KEYS).unwrap_or_default(),
        quality_score: parse_quality_score(record.first(QUALITY_KEYS))?,
        equipment_status,
    })
}

pub fn parse_temperature(value: Option<&Value>) -> Result<Option<f64>, FieldError> {
    let Some(value) = value else {
        return Ok(None);
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| FieldError::invalid("temperature", n.to_string(), "not a finite number")),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty()
                || trimmed.eq_ignore_ascii_case("null")
                || trimmed.eq_ignore_ascii_case("none")
                || trimmed.eq_ignore_ascii_case("nan")
            {
                return Ok(None);
            }
            match trimmed.parse::<f64>() {
                Ok(parsed) if parsed.is_finite() => Ok(Some(parsed)),
                Ok(_) => Err(FieldError::invalid("temperature", trimmed, "not a finite number")),
                Err(err) => Err(FieldError::invalid("temperature", trimmed, err.to_string())),
            }
        }
        other => Err(FieldError::invalid(
            "temperature",
            other.to_string(),
            "expected a number",
        )),
    }
}

/// RFC 3339 timestamps keep their offset; naive ISO timestamps are taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, FieldError> {
    static NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];

    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(dt.and_utc());
        }
    }
    Err(FieldError::invalid(
        "timestamp",
        trimmed,
        "expected an ISO 8601 timestamp",
    ))
}

/// Scores arrive as floats in `[0, 1]` or as 0/1 integers; they are stored as 0/1.
/// Absent scores count as good readings.
pub fn parse_quality_score(value: Option<&Value>) -> Result<i16, FieldError> {
    let score = match value {
        None | Some(Value::Null) => return Ok(1),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(1),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    let raw = value.map(Value::to_string).unwrap_or_default();
    let score = score.ok_or_else(|| FieldError::invalid("quality_score", raw.clone(), "expected a number"))?;
    if !(0.0..=1.0).contains(&score) {
        return Err(FieldError::invalid(
            "quality_score",
            raw,
            "must be between 0 and 1",
        ));
    }

    Ok(if score >= 0.5 { 1 } else { 0 })
}
