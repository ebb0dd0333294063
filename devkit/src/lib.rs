/*!
# Grid DevKit - Doubles et harness de test pour le coeur Grid

Permet de tester la synchronisation et le dispatch DNS sans Proxmox, sans
démon Docker, sans NATS et sans compte DNS :
- MockHypervisor / MockRuntimeConnector : flotte scriptée, compteurs d'appels, pannes injectées
- MockDnsProvider : zone en mémoire, IPs connues, latence simulée
- StalledStore : cache qui ne répond plus (timeouts)
- TestHarness : MemoryStore + FleetContext câblés sur les mocks
*/

pub mod dns_stub;
pub mod fleet_stub;
pub mod store_stub;
pub mod test_utils;

pub use dns_stub::MockDnsProvider;
pub use fleet_stub::{MockHypervisor, MockRuntimeConnector};
pub use store_stub::StalledStore;
pub use test_utils::{init_tracing, workload, TestHarness};
