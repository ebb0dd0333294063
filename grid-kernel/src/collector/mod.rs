/**
 * INVENTORY COLLECTOR - Collecte live des VMs et des conteneurs
 *
 * RÔLE :
 * Seul composant qui parle à l'infrastructure : l'hyperviseur pour la liste
 * des VMs, le runtime conteneurs de chaque VM pour ses workloads.
 *
 * FONCTIONNEMENT :
 * - Hypervisor trait : nœuds → invités → adresses (agent invité)
 * - Templates ignorés, adresses demandées uniquement pour les VMs démarrées
 * - Agent invité absent/HS = liste d'adresses vide, pas une erreur
 * - RuntimeConnector ouvre une session ContainerRuntime selon RuntimeAccess
 *   (socket local, ssh, http) ; la session est TOUJOURS fermée après usage,
 *   y compris quand la collecte est abandonnée (timeout, ctrl-c) : SessionGuard
 *
 * BACKENDS :
 * - proxmox::Proxmox (API REST PVE)
 * - docker::DockerConnector (Docker Engine API via bollard, local, http ou tunnel ssh)
 */

use crate::error::{GridError, GridResult};
use crate::models::{HostRecord, WorkloadRecord};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod docker;
pub mod proxmox;

pub use docker::DockerConnector;
pub use proxmox::Proxmox;

/// Un invité tel que rapporté par l'hyperviseur
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub vmid: u32,
    pub name: String,
    pub running: bool,
    pub uptime_secs: u64,
    pub template: bool,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn nodes(&self) -> GridResult<Vec<String>>;
    async fn guests(&self, node: &str) -> GridResult<Vec<GuestInfo>>;
    /// Adresses IPv4 remontées par l'agent invité
    async fn guest_addresses(&self, node: &str, vmid: u32) -> GridResult<Vec<String>>;
}

/// Comment joindre le runtime conteneurs d'un hôte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeAccess {
    /// socket docker de la machine courante
    Local,
    /// cible ssh `user@host`
    Ssh(String),
    /// Docker Engine exposé en HTTP (`http://host:2375`)
    Http(String),
}

impl RuntimeAccess {
    /// Interprète une adresse résolue : `self`/vide/`unix://` = local
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        if address.is_empty() || address == "self" || address.starts_with("unix://") {
            return RuntimeAccess::Local;
        }
        if let Some(target) = address.strip_prefix("ssh://") {
            return RuntimeAccess::Ssh(target.to_string());
        }
        if let Some(hostport) = address.strip_prefix("tcp://") {
            return RuntimeAccess::Http(format!("http://{hostport}"));
        }
        if address.starts_with("http://") || address.starts_with("https://") {
            return RuntimeAccess::Http(address.trim_end_matches('/').to_string());
        }
        RuntimeAccess::Ssh(address.to_string())
    }
}

impl fmt::Display for RuntimeAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeAccess::Local => write!(f, "local"),
            RuntimeAccess::Ssh(target) => write!(f, "ssh://{target}"),
            RuntimeAccess::Http(base) => write!(f, "{base}"),
        }
    }
}

/// Session ouverte sur un runtime conteneurs
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Conteneurs en cours d'exécution
    async fn list_workloads(&self) -> GridResult<Vec<WorkloadRecord>>;
    async fn close(&self);
}

#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, access: &RuntimeAccess) -> GridResult<Box<dyn ContainerRuntime>>;
}

#[derive(Clone)]
pub struct InventoryCollector {
    hypervisor: Arc<dyn Hypervisor>,
    connector: Arc<dyn RuntimeConnector>,
}

impl InventoryCollector {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, connector: Arc<dyn RuntimeConnector>) -> Self {
        Self { hypervisor, connector }
    }

    pub async fn nodes(&self) -> GridResult<Vec<String>> {
        self.hypervisor.nodes().await
    }

    /// Toutes les VMs (hors templates) de tous les nœuds
    pub async fn list_hosts(&self) -> GridResult<Vec<HostRecord>> {
        let mut hosts = Vec::new();
        for node in self.hypervisor.nodes().await? {
            for guest in self.hypervisor.guests(&node).await? {
                if guest.template {
                    continue;
                }
                let ip = if guest.running {
                    match self.hypervisor.guest_addresses(&node, guest.vmid).await {
                        Ok(ips) => ips,
                        Err(e) => {
                            debug!("no addresses for {} ({node}/{}): {e}", guest.name, guest.vmid);
                            Vec::new()
                        }
                    }
                } else {
                    Vec::new()
                };
                hosts.push(HostRecord::new(guest.name, guest.running, guest.uptime_secs, ip));
            }
        }
        debug!("collected {} hosts", hosts.len());
        Ok(hosts)
    }

    /// Liste les conteneurs d'un hôte ; la session est fermée dans tous les cas
    pub async fn list_workloads(&self, host: &str, access: &RuntimeAccess) -> GridResult<Vec<WorkloadRecord>> {
        let runtime = self
            .connector
            .connect(access)
            .await
            .map_err(|e| as_collection_error(host, e))?;
        let mut session = SessionGuard { runtime: Some(runtime), host: host.to_string() };

        let result = session.list().await;
        session.close().await;

        result.map_err(|e| {
            warn!("listing containers on {host} ({access}) failed: {e}");
            as_collection_error(host, e)
        })
    }
}

/// Ferme la session à l'abandon du future qui la porte
struct SessionGuard {
    runtime: Option<Box<dyn ContainerRuntime>>,
    host: String,
}

impl SessionGuard {
    async fn list(&self) -> GridResult<Vec<WorkloadRecord>> {
        match &self.runtime {
            Some(runtime) => runtime.list_workloads().await,
            None => Err(GridError::collection(&self.host, "session closed")),
        }
    }

    async fn close(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else { return };
        debug!("listing on {} abandoned, closing its session", self.host);
        // close() est async : hors runtime il ne reste que le Drop de la session
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { runtime.close().await });
        }
    }
}

fn as_collection_error(host: &str, err: GridError) -> GridError {
    match err {
        GridError::Timeout(_) => err,
        // le runtime ne connaît que son adresse, on réétiquette avec le nom d'hôte
        GridError::CollectionFailed { reason, .. } => GridError::collection(host, reason),
        other => GridError::collection(host, other),
    }
}
