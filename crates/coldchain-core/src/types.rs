//! Domain types shared by the scheduler, collectors, processor, queue and writer.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coldchain_parser::{normalize, EquipmentStatus, FieldError, RawRecord, TemperatureUnit};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TenantId = Uuid;

/// How a tenant exposes its readings. Registry rows carry `"api"` or `"csv"`;
/// anything else is kept verbatim so it can be reported and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SharingMethod {
    PushApi,
    PullCsv,
    Unsupported(String),
}

impl SharingMethod {
    pub fn from_registry(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "api" => SharingMethod::PushApi,
            "csv" => SharingMethod::PullCsv,
            _ => SharingMethod::Unsupported(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SharingMethod::PushApi => "api",
            SharingMethod::PullCsv => "csv",
            SharingMethod::Unsupported(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for SharingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SharingMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SharingMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SharingMethod::from_registry(&raw))
    }
}

/// A tenant's collection settings as read from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSource {
    pub id: TenantId,
    pub code: String,
    pub sharing_method: SharingMethod,
    #[serde(default)]
    pub source_url: Option<String>,
    pub polling_interval_seconds: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl TenantSource {
    /// Polling interval with `floor_secs` applied. Values below the floor,
    /// including zero and negatives, are raised to it.
    pub fn polling_interval(&self, floor_secs: u64) -> Duration {
        let floor = floor_secs.max(1);
        let requested = u64::try_from(self.polling_interval_seconds).unwrap_or(0);
        if requested < floor {
            tracing::warn!(
                tenant = %self.code,
                requested = self.polling_interval_seconds,
                floor,
                "polling interval below floor, clamping"
            );
            Duration::from_secs(floor)
        } else {
            Duration::from_secs(requested)
        }
    }

    /// True when a change requires the tenant's timer to be rebuilt.
    pub fn schedule_differs(&self, other: &TenantSource) -> bool {
        self.sharing_method != other.sharing_method
            || self.source_url != other.source_url
            || self.polling_interval_seconds != other.polling_interval_seconds
            || self.code != other.code
    }
}

/// A facility row from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub facility_code: String,
}

/// A storage unit row from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: Uuid,
    pub facility_id: Uuid,
    pub unit_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Success,
    Warning,
    Failure,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Success => "success",
            IngestionStatus::Warning => "warning",
            IngestionStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "warning" => Some(Self::Warning),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One collection attempt for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionLogEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub method: String,
    pub status: IngestionStatus,
    pub records_processed: i32,
    pub records_succeeded: i32,
    pub records_failed: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub source_url: Option<String>,
}

impl IngestionLogEntry {
    pub fn pending(tenant: &TenantSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            method: tenant.sharing_method.as_str().to_string(),
            status: IngestionStatus::Pending,
            records_processed: 0,
            records_succeeded: 0,
            records_failed: 0,
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            source_url: tenant.source_url.clone(),
        }
    }

    /// Marks the attempt failed. Counters already recorded are kept.
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.status = IngestionStatus::Failure;
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now());
        self
    }

    /// Records counters and derives `warning` or `success` from them.
    pub fn complete(mut self, succeeded: usize, failed: usize) -> Self {
        self.records_processed = saturating_i32(succeeded + failed);
        self.records_succeeded = saturating_i32(succeeded);
        self.records_failed = saturating_i32(failed);
        self.status = if failed > 0 || succeeded + failed == 0 {
            IngestionStatus::Warning
        } else {
            IngestionStatus::Success
        };
        self.end_time = Some(Utc::now());
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.status != IngestionStatus::Pending && self.end_time.is_some()
    }
}

fn saturating_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// A mapped reading in flight between the processor and the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub facility_id: Uuid,
    pub unit_id: Uuid,
    pub payload: RawRecord,
    pub routing_key: String,
    pub emitted_at: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn new(tenant_id: TenantId, facility_id: Uuid, unit_id: Uuid, payload: RawRecord) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id,
            facility_id,
            unit_id,
            payload,
            routing_key: routing_key(tenant_id, facility_id, unit_id),
            emitted_at: Utc::now(),
        }
    }
}

pub fn routing_key(tenant_id: TenantId, facility_id: Uuid, unit_id: Uuid) -> String {
    format!("reading.{tenant_id}.{facility_id}.{unit_id}")
}

/// A row of `temperature_readings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub facility_id: Uuid,
    pub unit_id: Uuid,
    pub temperature: Option<f64>,
    pub temperature_unit: TemperatureUnit,
    pub recorded_at: DateTime<Utc>,
    pub sensor_id: String,
    pub quality_score: i16,
    pub equipment_status: EquipmentStatus,
}

impl TemperatureReading {
    /// The reading keeps the event's id, so a redelivered event maps onto the
    /// row it already produced.
    pub fn from_event(event: &CanonicalEvent) -> Result<Self, FieldError> {
        let normalized = normalize(&event.payload)?;
        Ok(Self {
            id: event.event_id,
            tenant_id: event.tenant_id,
            facility_id: event.facility_id,
            unit_id: event.unit_id,
            temperature: normalized.temperature,
            temperature_unit: normalized.temperature_unit,
            recorded_at: normalized.recorded_at,
            sensor_id: normalized.sensor_id,
            quality_score: normalized.quality_score,
            equipment_status: normalized.equipment_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(interval: i64) -> TenantSource {
        TenantSource {
            id: Uuid::new_v4(),
            code: "T".into(),
            sharing_method: SharingMethod::PullCsv,
            source_url: None,
            polling_interval_seconds: interval,
            active: true,
        }
    }

    #[test]
    fn sharing_method_maps_registry_values() {
        assert_eq!(SharingMethod::from_registry("api"), SharingMethod::PushApi);
        assert_eq!(SharingMethod::from_registry(" CSV "), SharingMethod::PullCsv);
        assert_eq!(
            SharingMethod::from_registry("ftp"),
            SharingMethod::Unsupported("ftp".into())
        );
    }

    #[test]
    fn polling_interval_is_clamped_to_floor() {
        assert_eq!(tenant(300).polling_interval(10), Duration::from_secs(300));
        assert_eq!(tenant(2).polling_interval(10), Duration::from_secs(10));
        assert_eq!(tenant(0).polling_interval(10), Duration::from_secs(10));
        assert_eq!(tenant(-5).polling_interval(10), Duration::from_secs(10));
    }

    #[test]
    fn completed_log_derives_status_from_counts() {
        let t = tenant(60);
        let log = IngestionLogEntry::pending(&t).complete(2, 1);
        assert_eq!(log.status, IngestionStatus::Warning);
        assert_eq!(log.records_processed, 3);
        assert_eq!(log.records_failed, 1);

        let log = IngestionLogEntry::pending(&t).complete(0, 0);
        assert_eq!(log.status, IngestionStatus::Warning);

        let log = IngestionLogEntry::pending(&t).complete(5, 0);
        assert_eq!(log.status, IngestionStatus::Success);
        assert!(log.is_finalized());
    }

    #[test]
    fn failed_log_keeps_message() {
        let log = IngestionLogEntry::pending(&tenant(60)).fail("boom");
        assert_eq!(log.status, IngestionStatus::Failure);
        assert_eq!(log.error_message.as_deref(), Some("boom"));
        assert!(log.end_time.is_some());
    }

    #[test]
    fn event_routing_key_uses_internal_ids() {
        let (t, f, u) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let event = CanonicalEvent::new(t, f, u, RawRecord::default());
        assert_eq!(event.routing_key, format!("reading.{t}.{f}.{u}"));
    }

    #[test]
    fn reading_from_event_normalizes_payload() {
        let payload = RawRecord::from_pairs([
            ("facility_id", "F1"),
            ("unit_id", "U1"),
            ("temperature", "-20.5"),
            ("timestamp", "2025-03-01T10:00:00Z"),
        ]);
        let event = CanonicalEvent::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), payload);
        let reading = TemperatureReading::from_event(&event).expect("convert");
        assert_eq!(reading.temperature, Some(-20.5));
        assert_eq!(reading.id, event.event_id);
        assert_eq!(reading.unit_id, event.unit_id);
        assert_eq!(reading.equipment_status, EquipmentStatus::Normal);

        let broken = CanonicalEvent::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), RawRecord::default());
        assert!(TemperatureReading::from_event(&broken).is_err());
    }
}
