/*!
Mock hyperviseur et runtime conteneurs

Remplacent Proxmox et Docker dans les tests : la flotte est scriptée, chaque
appel est compté, et une panne ou une latence peut être injectée par hôte.
*/

use async_trait::async_trait;
use grid_kernel::collector::{ContainerRuntime, GuestInfo, Hypervisor, RuntimeAccess, RuntimeConnector};
use grid_kernel::error::{GridError, GridResult};
use grid_kernel::models::WorkloadRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct ScriptedGuest {
    node: String,
    info: GuestInfo,
    addresses: Vec<String>,
}

/// Hyperviseur scripté : nœuds, invités et adresses fixés par le test
#[derive(Default)]
pub struct MockHypervisor {
    guests: Mutex<Vec<ScriptedGuest>>,
    unreachable: Mutex<Option<String>>,
    listings: AtomicUsize,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute une VM sur le nœud `node` (vmid attribué dans l'ordre d'ajout)
    pub fn vm(self, node: &str, name: &str, running: bool, uptime_secs: u64, addresses: &[&str]) -> Self {
        {
            let mut guests = self.guests.lock();
            let vmid = 100 + guests.len() as u32;
            guests.push(ScriptedGuest {
                node: node.to_string(),
                info: GuestInfo { vmid, name: name.to_string(), running, uptime_secs, template: false },
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
            });
        }
        self
    }

    pub fn template(self, node: &str, name: &str) -> Self {
        {
            let mut guests = self.guests.lock();
            let vmid = 9000 + guests.len() as u32;
            guests.push(ScriptedGuest {
                node: node.to_string(),
                info: GuestInfo { vmid, name: name.to_string(), running: false, uptime_secs: 0, template: true },
                addresses: Vec::new(),
            });
        }
        self
    }

    /// Toute énumération échoue ensuite avec `reason`
    pub fn set_unreachable(&self, reason: &str) {
        *self.unreachable.lock() = Some(reason.to_string());
    }

    /// Nombre d'énumérations de nœuds (= collectes live d'hôtes)
    pub fn listing_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn nodes(&self) -> GridResult<Vec<String>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.unreachable.lock().clone() {
            return Err(GridError::collection("hypervisor", reason));
        }
        let mut nodes: Vec<String> = self.guests.lock().iter().map(|g| g.node.clone()).collect();
        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }

    async fn guests(&self, node: &str) -> GridResult<Vec<GuestInfo>> {
        Ok(self.guests.lock().iter().filter(|g| g.node == node).map(|g| g.info.clone()).collect())
    }

    async fn guest_addresses(&self, node: &str, vmid: u32) -> GridResult<Vec<String>> {
        self.guests
            .lock()
            .iter()
            .find(|g| g.node == node && g.info.vmid == vmid)
            .map(|g| g.addresses.clone())
            .ok_or_else(|| GridError::collection(node, format!("guest agent not running on {vmid}")))
    }
}

#[derive(Clone)]
enum Behaviour {
    Workloads(Vec<WorkloadRecord>),
    Fail(String),
}

#[derive(Default)]
struct RuntimeState {
    behaviours: HashMap<String, Behaviour>,
    delays: HashMap<String, Duration>,
    lists: HashMap<String, usize>,
    in_flight: usize,
    peak: usize,
}

/// Runtime conteneurs scripté, indexé par machine cible
/// (IP pour `ssh://user@ip`, `self` pour le démon local, URL pour HTTP)
#[derive(Default)]
pub struct MockRuntimeConnector {
    state: Arc<Mutex<RuntimeState>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

fn target_of(access: &RuntimeAccess) -> String {
    match access {
        RuntimeAccess::Local => "self".to_string(),
        RuntimeAccess::Ssh(target) => target.rsplit('@').next().unwrap_or(target).to_string(),
        RuntimeAccess::Http(base) => base.clone(),
    }
}

impl MockRuntimeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workloads(self, target: &str, workloads: Vec<WorkloadRecord>) -> Self {
        self.state.lock().behaviours.insert(target.to_string(), Behaviour::Workloads(workloads));
        self
    }

    pub fn failing(self, target: &str, reason: &str) -> Self {
        self.state.lock().behaviours.insert(target.to_string(), Behaviour::Fail(reason.to_string()));
        self
    }

    /// Chaque listing sur `target` attend `delay` avant de répondre
    pub fn slow(self, target: &str, delay: Duration) -> Self {
        self.state.lock().delays.insert(target.to_string(), delay);
        self
    }

    /// Listings effectués, toutes cibles confondues
    pub fn list_count(&self) -> usize {
        self.state.lock().lists.values().sum()
    }

    /// Plus grand nombre de listings simultanés observé
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().peak
    }

    pub fn lists_for(&self, target: &str) -> usize {
        self.state.lock().lists.get(target).copied().unwrap_or(0)
    }

    /// Sessions ouvertes et pas encore fermées
    pub fn open_sessions(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeConnector for MockRuntimeConnector {
    async fn connect(&self, access: &RuntimeAccess) -> GridResult<Box<dyn ContainerRuntime>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            target: target_of(access),
            state: self.state.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct MockSession {
    target: String,
    state: Arc<Mutex<RuntimeState>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ContainerRuntime for MockSession {
    async fn list_workloads(&self) -> GridResult<Vec<WorkloadRecord>> {
        let (behaviour, delay) = {
            let mut state = self.state.lock();
            *state.lists.entry(self.target.clone()).or_default() += 1;
            state.in_flight += 1;
            state.peak = state.peak.max(state.in_flight);
            (state.behaviours.get(&self.target).cloned(), state.delays.get(&self.target).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().in_flight -= 1;
        match behaviour {
            Some(Behaviour::Workloads(w)) => Ok(w),
            Some(Behaviour::Fail(reason)) => Err(GridError::collection(&self.target, reason)),
            None => Ok(Vec::new()),
        }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
