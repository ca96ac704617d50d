//! Read-only access to tenant configuration and identifier tables.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{FacilityRecord, SharingMethod, TenantId, TenantSource, UnitRecord};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to read registry file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<TenantSource>, RegistryError>;

    /// Looks a tenant up by code regardless of its active flag.
    async fn tenant_by_code(&self, code: &str) -> Result<Option<TenantSource>, RegistryError>;

    async fn facilities(&self, tenant_id: TenantId) -> Result<Vec<FacilityRecord>, RegistryError>;

    async fn units(&self, tenant_id: TenantId) -> Result<Vec<UnitRecord>, RegistryError>;
}

/// Registry backed by the `customers`, `facilities` and `storage_units` tables.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn tenant_from_row(row: sqlx::postgres::PgRow) -> Result<TenantSource, sqlx::Error> {
    let method: String = row.try_get("data_sharing_method")?;
    let interval: i32 = row.try_get("data_frequency_seconds")?;
    Ok(TenantSource {
        id: row.try_get("id")?,
        code: row.try_get("customer_code")?,
        sharing_method: SharingMethod::from_registry(&method),
        source_url: row.try_get("api_url")?,
        polling_interval_seconds: i64::from(interval),
        active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl TenantRegistry for PostgresRegistry {
    async fn active_tenants(&self) -> Result<Vec<TenantSource>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_code, data_sharing_method, data_frequency_seconds, api_url, is_active
            FROM customers
            WHERE is_active = TRUE
            ORDER BY customer_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(tenant_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn tenant_by_code(&self, code: &str) -> Result<Option<TenantSource>, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_code, data_sharing_method, data_frequency_seconds, api_url, is_active
            FROM customers
            WHERE customer_code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(tenant_from_row).transpose()?)
    }

    async fn facilities(&self, tenant_id: TenantId) -> Result<Vec<FacilityRecord>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, facility_code
            FROM facilities
            WHERE customer_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut facilities = Vec::with_capacity(rows.len());
        for row in rows {
            facilities.push(FacilityRecord {
                id: row.try_get("id")?,
                tenant_id,
                facility_code: row.try_get("facility_code")?,
            });
        }
        Ok(facilities)
    }

    async fn units(&self, tenant_id: TenantId) -> Result<Vec<UnitRecord>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT su.id, su.facility_id, su.unit_code
            FROM storage_units su
            JOIN facilities f ON f.id = su.facility_id
            WHERE f.customer_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut units = Vec::with_capacity(rows.len());
        for row in rows {
            units.push(UnitRecord {
                id: row.try_get("id")?,
                facility_id: row.try_get("facility_id")?,
                unit_code: row.try_get("unit_code")?,
            });
        }
        Ok(units)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tenants: Vec<TenantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TenantEntry {
    #[serde(flatten)]
    source: TenantSource,
    #[serde(default)]
    facilities: Vec<FacilityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct FacilityEntry {
    id: Uuid,
    code: String,
    #[serde(default)]
    units: Vec<UnitEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnitEntry {
    id: Uuid,
    code: String,
}

#[derive(Debug, Clone, Default)]
struct StaticState {
    tenants: Vec<TenantSource>,
    facilities: Vec<FacilityRecord>,
    units: Vec<UnitRecord>,
}

/// In-process registry loaded from a TOML file or built in code.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    state: RwLock<StaticState>,
}

impl StaticRegistry {
    pub fn new(
        tenants: Vec<TenantSource>,
        facilities: Vec<FacilityRecord>,
        units: Vec<UnitRecord>,
    ) -> Self {
        Self {
            state: RwLock::new(StaticState {
                tenants,
                facilities,
                units,
            }),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(raw)?;
        let mut state = StaticState::default();
        for entry in file.tenants {
            for facility in entry.facilities {
                for unit in facility.units {
                    state.units.push(UnitRecord {
                        id: unit.id,
                        facility_id: facility.id,
                        unit_code: unit.code,
                    });
                }
                state.facilities.push(FacilityRecord {
                    id: facility.id,
                    tenant_id: entry.source.id,
                    facility_code: facility.code,
                });
            }
            state.tenants.push(entry.source);
        }
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StaticState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StaticState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts or replaces a tenant by id.
    pub fn upsert_tenant(&self, tenant: TenantSource) {
        let mut state = self.write();
        match state.tenants.iter_mut().find(|existing| existing.id == tenant.id) {
            Some(existing) => *existing = tenant,
            None => state.tenants.push(tenant),
        }
    }

    pub fn add_facility(&self, facility: FacilityRecord) {
        self.write().facilities.push(facility);
    }

    pub fn add_unit(&self, unit: UnitRecord) {
        self.write().units.push(unit);
    }
}

#[async_trait]
impl TenantRegistry for StaticRegistry {
    async fn active_tenants(&self) -> Result<Vec<TenantSource>, RegistryError> {
        Ok(self
            .read()
            .tenants
            .iter()
            .filter(|tenant| tenant.active)
            .cloned()
            .collect())
    }

    async fn tenant_by_code(&self, code: &str) -> Result<Option<TenantSource>, RegistryError> {
        Ok(self
            .read()
            .tenants
            .iter()
            .find(|tenant| tenant.code == code)
            .cloned())
    }

    async fn facilities(&self, tenant_id: TenantId) -> Result<Vec<FacilityRecord>, RegistryError> {
        Ok(self
            .read()
            .facilities
            .iter()
            .filter(|facility| facility.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn units(&self, tenant_id: TenantId) -> Result<Vec<UnitRecord>, RegistryError> {
        let state = self.read();
        let facility_ids: Vec<Uuid> = state
            .facilities
            .iter()
            .filter(|facility| facility.tenant_id == tenant_id)
            .map(|facility| facility.id)
            .collect();
        Ok(state
            .units
            .iter()
            .filter(|unit| facility_ids.contains(&unit.facility_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
        [[tenants]]
        id = "6f1c1d8e-0d7e-4d55-9a55-2d1f8f8f0001"
        code = "A"
        sharing_method = "csv"
        source_url = "http://localhost/a.csv"
        polling_interval_seconds = 300

        [[tenants.facilities]]
        id = "6f1c1d8e-0d7e-4d55-9a55-2d1f8f8f0101"
        code = "FAC-01"

        [[tenants.facilities.units]]
        id = "6f1c1d8e-0d7e-4d55-9a55-2d1f8f8f0201"
        code = "UNIT-A"

        [[tenants]]
        id = "6f1c1d8e-0d7e-4d55-9a55-2d1f8f8f0002"
        code = "B"
        sharing_method = "api"
        polling_interval_seconds = 900
        active = false
    "#;

    #[tokio::test]
    async fn static_registry_loads_nested_tables() {
        let registry = StaticRegistry::from_toml_str(REGISTRY).expect("parse registry");

        let active = registry.active_tenants().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "A");
        assert_eq!(active[0].sharing_method, SharingMethod::PullCsv);

        let inactive = registry.tenant_by_code("B").await.unwrap().expect("tenant B");
        assert!(!inactive.active);
        assert_eq!(inactive.source_url, None);

        let facilities = registry.facilities(active[0].id).await.unwrap();
        assert_eq!(facilities.len(), 1);
        let units = registry.units(active[0].id).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].facility_id, facilities[0].id);
        assert!(registry.units(inactive.id).await.unwrap().is_empty());
    }
}
