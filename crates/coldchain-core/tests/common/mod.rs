#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use coldchain_core::registry::StaticRegistry;
use coldchain_core::types::{FacilityRecord, SharingMethod, TenantSource, UnitRecord};
use uuid::Uuid;

pub fn fixture(name: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../coldchain-parser/tests/data")
        .join(name);
    std::fs::read(path).expect("read fixture")
}

pub fn tenant(code: &str, method: SharingMethod, url: Option<String>, interval: i64) -> TenantSource {
    TenantSource {
        id: Uuid::new_v4(),
        code: code.to_string(),
        sharing_method: method,
        source_url: url,
        polling_interval_seconds: interval,
        active: true,
    }
}

/// Ids assigned to a tenant's facilities and units, keyed by code.
pub struct Mapped {
    pub facilities: Vec<(String, Uuid)>,
    pub units: Vec<(String, String, Uuid)>,
}

impl Mapped {
    pub fn unit(&self, facility: &str, unit: &str) -> Uuid {
        self.units
            .iter()
            .find(|(f, u, _)| f == facility && u == unit)
            .map(|(_, _, id)| *id)
            .expect("unit mapped")
    }
}

/// Registers `layout` (facility code, unit codes) for `tenant`.
pub fn map_tenant(registry: &StaticRegistry, tenant: &TenantSource, layout: &[(&str, &[&str])]) -> Mapped {
    registry.upsert_tenant(tenant.clone());
    let mut mapped = Mapped {
        facilities: Vec::new(),
        units: Vec::new(),
    };
    for (facility_code, unit_codes) in layout {
        let facility_id = Uuid::new_v4();
        registry.add_facility(FacilityRecord {
            id: facility_id,
            tenant_id: tenant.id,
            facility_code: facility_code.to_string(),
        });
        mapped.facilities.push((facility_code.to_string(), facility_id));
        for unit_code in *unit_codes {
            let unit_id = Uuid::new_v4();
            registry.add_unit(UnitRecord {
                id: unit_id,
                facility_id,
                unit_code: unit_code.to_string(),
            });
            mapped
                .units
                .push((facility_code.to_string(), unit_code.to_string(), unit_id));
        }
    }
    mapped
}

pub fn empty_registry() -> Arc<StaticRegistry> {
    Arc::new(StaticRegistry::new(Vec::new(), Vec::new(), Vec::new()))
}

/// Serves `router` on an ephemeral port and returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}")
}
