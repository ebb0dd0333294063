/*!
Test Harness pour le coeur Grid

Câble un FleetContext complet sur un MemoryStore et les mocks de flotte,
avec accès direct à chaque pièce pour les assertions.
*/

use crate::fleet_stub::{MockHypervisor, MockRuntimeConnector};
use grid_kernel::collector::InventoryCollector;
use grid_kernel::models::WorkloadRecord;
use grid_kernel::store::{CacheBuckets, MemoryStore, SharedStore};
use grid_kernel::sync::{FleetContext, SyncSettings};
use std::sync::Arc;
use std::time::Duration;

pub const FLEET: &str = "lab";
pub const PRIVATE_PREFIX: &str = "192.168";

/// Logs des tests via le writer de libtest (visibles avec --nocapture)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("grid_kernel=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Conteneur minimal : id dérivé du nom, image `{name}:latest`
pub fn workload(name: &str, created: i64) -> WorkloadRecord {
    WorkloadRecord {
        id: format!("{:0<64}", name.bytes().map(|b| format!("{b:02x}")).collect::<String>()),
        names: vec![format!("/{name}")],
        image: format!("{name}:latest"),
        ports: Vec::new(),
        created,
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub hypervisor: Arc<MockHypervisor>,
    pub runtime: Arc<MockRuntimeConnector>,
    pub settings: SyncSettings,
}

impl TestHarness {
    pub fn new(hypervisor: MockHypervisor, runtime: MockRuntimeConnector) -> Self {
        init_tracing();
        Self {
            store: Arc::new(MemoryStore::new(Default::default())),
            hypervisor: Arc::new(hypervisor),
            runtime: Arc::new(runtime),
            settings: SyncSettings::default(),
        }
    }

    /// alpha (démarrée, 192.168.1.10, deux conteneurs) et beta (arrêtée)
    pub fn alpha_beta() -> Self {
        let hypervisor = MockHypervisor::new()
            .vm("pve", "alpha", true, 3 * 86_400, &["10.10.0.4", "192.168.1.10"])
            .vm("pve", "beta", false, 0, &[]);
        let runtime = MockRuntimeConnector::new()
            .with_workloads("192.168.1.10", vec![workload("web", 1_700_000_000), workload("db", 1_700_000_000)]);
        Self::new(hypervisor, runtime)
    }

    pub fn with_ttl(self, ttl: Duration) -> Self {
        Self { store: Arc::new(MemoryStore::with_ttl(ttl)), ..self }
    }

    pub fn with_settings(self, settings: SyncSettings) -> Self {
        Self { settings, ..self }
    }

    pub fn buckets(&self) -> CacheBuckets {
        CacheBuckets::for_fleet(FLEET)
    }

    /// Nouveau contexte partageant store et mocks du harness
    pub fn context(&self) -> FleetContext {
        self.context_on(self.store.clone())
    }

    /// Même flotte scriptée, autre backend de cache
    pub fn context_on(&self, store: SharedStore) -> FleetContext {
        let collector = InventoryCollector::new(self.hypervisor.clone(), self.runtime.clone());
        FleetContext::new(store, FLEET, PRIVATE_PREFIX, collector, self.settings.clone())
    }
}
