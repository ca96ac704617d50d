//! Per-tenant lookup from tenant-local facility and unit codes to internal ids.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::registry::{RegistryError, TenantRegistry};
use crate::types::{FacilityRecord, TenantId, UnitRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierCache {
    facilities: HashMap<String, Uuid>,
    units: HashMap<(Uuid, String), Uuid>,
}

impl IdentifierCache {
    pub fn from_records<F, U>(facilities: F, units: U) -> Self
    where
        F: IntoIterator<Item = FacilityRecord>,
        U: IntoIterator<Item = UnitRecord>,
    {
        Self {
            facilities: facilities
                .into_iter()
                .map(|facility| (facility.facility_code, facility.id))
                .collect(),
            units: units
                .into_iter()
                .map(|unit| ((unit.facility_id, unit.unit_code), unit.id))
                .collect(),
        }
    }

    pub fn facility_id(&self, facility_code: &str) -> Option<Uuid> {
        self.facilities.get(facility_code).copied()
    }

    pub fn unit_id(&self, facility_id: Uuid, unit_code: &str) -> Option<Uuid> {
        self.units.get(&(facility_id, unit_code.to_string())).copied()
    }

    pub fn facility_count(&self) -> usize {
        self.facilities.len()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

/// Caches for every tenant seen so far. Each entry is loaded on first use
/// and kept until invalidated. Two jobs racing on the same cold tenant both
/// load it; the result is identical either way. A load that overlaps an
/// invalidation is returned to its caller but not cached.
#[derive(Default)]
pub struct IdentifierCacheSet {
    state: RwLock<CacheState>,
}

#[derive(Default)]
struct CacheState {
    caches: HashMap<TenantId, Arc<IdentifierCache>>,
    /// Bumped by `invalidate`; absent means zero.
    generations: HashMap<TenantId, u64>,
    /// Bumped by `invalidate_all`.
    epoch: u64,
}

impl CacheState {
    fn generation(&self, tenant_id: TenantId) -> (u64, u64) {
        (self.epoch, self.generations.get(&tenant_id).copied().unwrap_or(0))
    }
}

impl IdentifierCacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached(&self, tenant_id: TenantId) -> Option<Arc<IdentifierCache>> {
        self.read().caches.get(&tenant_id).cloned()
    }

    pub async fn get_or_load(
        &self,
        tenant_id: TenantId,
        registry: &dyn TenantRegistry,
    ) -> Result<Arc<IdentifierCache>, RegistryError> {
        let generation = {
            let state = self.read();
            if let Some(cache) = state.caches.get(&tenant_id) {
                return Ok(Arc::clone(cache));
            }
            state.generation(tenant_id)
        };

        let (facilities, units) =
            futures::try_join!(registry.facilities(tenant_id), registry.units(tenant_id))?;
        let cache = Arc::new(IdentifierCache::from_records(facilities, units));
        tracing::info!(
            tenant_id = %tenant_id,
            facilities = cache.facility_count(),
            units = cache.unit_count(),
            "loaded identifier mappings"
        );

        let mut state = self.write();
        if state.generation(tenant_id) == generation {
            state.caches.insert(tenant_id, Arc::clone(&cache));
        } else {
            tracing::debug!(tenant_id = %tenant_id, "mappings invalidated during load, not caching");
        }
        Ok(cache)
    }

    pub fn invalidate(&self, tenant_id: TenantId) {
        let mut state = self.write();
        *state.generations.entry(tenant_id).or_default() += 1;
        if state.caches.remove(&tenant_id).is_some() {
            tracing::debug!(tenant_id = %tenant_id, "identifier mappings invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        let mut state = self.write();
        state.epoch += 1;
        state.caches.clear();
    }

    pub fn len(&self) -> usize {
        self.read().caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().caches.is_empty()
    }
}
