/**
 * SYNC ORCHESTRATOR - Cache d'abord, collecte live en secours
 *
 * RÔLE :
 * Décide pour chaque lecture si on sert le cache ou si on interroge
 * l'infrastructure, et assemble le rapport de flotte (VMs + conteneurs).
 *
 * FONCTIONNEMENT :
 * - OnDemand : cache d'abord ; cache vide/manquant → collecte live + écriture
 * - Forced   : collecte live systématique, le cache est réécrit
 * - Store HS ou muet (timeout) : on bascule en live-only, sans écriture, avec
 *   le flag `degraded`
 * - Écriture des VMs collectées on-demand si `sync.enabled` ; les conteneurs
 *   collectés sont toujours réécrits
 * - Par hôte : timeout + parallélisme borné ; un hôte en échec est noté dans
 *   `failures` et n'efface jamais les données des autres
 * - Les résultats sont fusionnés une fois la collecte terminée (un seul écrivain)
 *
 * ÉTAPES (tracing) :
 * CheckCache → ReturnCached | CollectLive → WriteCache → ReturnResult | Failed
 */

use crate::collector::{DockerConnector, InventoryCollector, Proxmox, RuntimeAccess};
use crate::config::GridConfig;
use crate::error::{GridError, GridResult};
use crate::models::{HostRecord, WorkloadRecord};
use crate::resolver::{preferred_address, HostResolver};
use crate::store::{get_json, open_store, put_json, CacheBuckets, SharedStore};
use futures::stream::{self, StreamExt};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    OnDemand,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Live,
}

#[derive(Debug, Clone, Copy)]
enum SyncPhase {
    CheckCache,
    ReturnCached,
    CollectLive,
    WriteCache,
    ReturnResult,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::CheckCache => "check-cache",
            SyncPhase::ReturnCached => "return-cached",
            SyncPhase::CollectLive => "collect-live",
            SyncPhase::WriteCache => "write-cache",
            SyncPhase::ReturnResult => "return-result",
            SyncPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn phase(step: SyncPhase, subject: &str) {
    match step {
        SyncPhase::Failed => warn!("[{step}] {subject}"),
        _ => debug!("[{step}] {subject}"),
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub ssh_user: String,
    pub host_timeout: Duration,
    pub concurrency: usize,
    /// écrit dans le cache les VMs d'une collecte on-demand
    pub write_through: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ssh_user: "root".into(),
            host_timeout: Duration::from_secs(10),
            concurrency: 4,
            write_through: true,
        }
    }
}

/// Le cache ne répond pas : on sert du live sans écrire
fn store_down(err: &GridError) -> bool {
    matches!(err, GridError::StoreUnavailable(_) | GridError::Timeout(_))
}

impl SyncSettings {
    pub fn from_config(cfg: &GridConfig) -> Self {
        Self {
            ssh_user: cfg.ssh.user.clone(),
            host_timeout: Duration::from_secs(cfg.sync.host_timeout_secs.max(1)),
            concurrency: cfg.sync.concurrency.max(1),
            write_through: cfg.sync.enabled,
        }
    }
}

/// Liste des VMs et provenance
#[derive(Debug, Clone, Serialize)]
pub struct HostListing {
    pub hosts: Vec<HostRecord>,
    pub source: DataSource,
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct WorkloadFetch {
    pub workloads: Vec<WorkloadRecord>,
    pub source: DataSource,
    pub degraded: bool,
}

/// Clé d'une entrée du rapport : nom de la VM + adresse utilisée
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct HostKey {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetTotals {
    pub hosts: usize,
    pub running: usize,
    pub workloads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Complete,
    Partial { failed: usize },
    TotalFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    #[serde(serialize_with = "entries_as_list")]
    pub entries: BTreeMap<HostKey, Vec<WorkloadRecord>>,
    pub failures: BTreeMap<String, String>,
    pub totals: FleetTotals,
    pub source: DataSource,
    pub degraded: bool,
}

/// Une clé JSON ne peut pas être une struct : les entrées sortent en liste
fn entries_as_list<S: Serializer>(
    entries: &BTreeMap<HostKey, Vec<WorkloadRecord>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Entry<'a> {
        host: &'a str,
        address: &'a str,
        workloads: &'a [WorkloadRecord],
    }

    let mut seq = serializer.serialize_seq(Some(entries.len()))?;
    for (key, workloads) in entries {
        seq.serialize_element(&Entry { host: &key.name, address: &key.address, workloads })?;
    }
    seq.end()
}

impl FleetReport {
    fn assemble(listing: &HostListing, results: Vec<(HostKey, GridResult<WorkloadFetch>)>) -> Self {
        let mut entries = BTreeMap::new();
        let mut failures = BTreeMap::new();
        let mut degraded = listing.degraded;

        for (key, result) in results {
            match result {
                Ok(fetch) => {
                    degraded |= fetch.degraded;
                    entries.insert(key, fetch.workloads);
                }
                Err(e) => {
                    failures.insert(key.name, e.to_string());
                }
            }
        }

        let totals = FleetTotals {
            hosts: listing.hosts.len(),
            running: listing.hosts.iter().filter(|h| h.running).count(),
            workloads: entries.values().map(Vec::len).sum(),
        };
        Self { entries, failures, totals, source: listing.source, degraded }
    }

    pub fn outcome(&self) -> SyncOutcome {
        if self.failures.is_empty() {
            SyncOutcome::Complete
        } else if self.entries.is_empty() {
            SyncOutcome::TotalFailure
        } else {
            SyncOutcome::Partial { failed: self.failures.len() }
        }
    }

    pub fn workloads_of(&self, host: &str) -> Option<&[WorkloadRecord]> {
        self.entries.iter().find(|(k, _)| k.name == host).map(|(_, w)| w.as_slice())
    }
}

/// Tout ce dont la synchronisation a besoin, passé explicitement (aucun état global)
#[derive(Clone)]
pub struct FleetContext {
    store: SharedStore,
    buckets: CacheBuckets,
    resolver: HostResolver,
    collector: InventoryCollector,
    settings: SyncSettings,
}

impl FleetContext {
    pub fn new(
        store: SharedStore,
        fleet: &str,
        private_prefix: &str,
        collector: InventoryCollector,
        settings: SyncSettings,
    ) -> Self {
        let buckets = CacheBuckets::for_fleet(fleet);
        let resolver = HostResolver::new(store.clone(), buckets.clone(), private_prefix);
        Self { store, buckets, resolver, collector, settings }
    }

    /// Câble les backends réels (NATS, Proxmox, Docker) depuis la config
    pub async fn from_config(cfg: &GridConfig) -> GridResult<Self> {
        let store = open_store(&cfg.nats).await?;
        let settings = SyncSettings::from_config(cfg);
        let hypervisor = Arc::new(Proxmox::new(&cfg.proxmox)?);
        let connector = Arc::new(DockerConnector::new(&cfg.ssh, settings.host_timeout));
        let collector = InventoryCollector::new(hypervisor, connector);
        Ok(Self::new(store, &cfg.nats.bucket, &cfg.network.private_prefix, collector, settings))
    }

    pub fn buckets(&self) -> &CacheBuckets {
        &self.buckets
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    async fn cached_hosts(&self) -> GridResult<Vec<HostRecord>> {
        let keys = self.store.list_keys(&self.buckets.hosts).await?;
        let mut hosts = Vec::with_capacity(keys.len());
        for key in keys {
            match get_json::<HostRecord>(self.store.as_ref(), &self.buckets.hosts, &key).await {
                Ok(host) => hosts.push(host),
                // expirée entre list_keys et get
                Err(GridError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(hosts)
    }

    pub async fn hosts(&self, mode: SyncMode) -> GridResult<HostListing> {
        let mut degraded = false;

        if mode == SyncMode::OnDemand {
            phase(SyncPhase::CheckCache, &self.buckets.hosts);
            match self.cached_hosts().await {
                Ok(hosts) if !hosts.is_empty() => {
                    phase(SyncPhase::ReturnCached, &format!("{} hosts", hosts.len()));
                    return Ok(HostListing { hosts, source: DataSource::Cache, degraded: false });
                }
                Ok(_) => {}
                Err(e) if store_down(&e) => {
                    warn!("cache unavailable, serving live data only: {e}");
                    degraded = true;
                }
                Err(e) => return Err(e),
            }
        }

        phase(SyncPhase::CollectLive, "hypervisor");
        let hosts = match self.collector.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                phase(SyncPhase::Failed, &format!("host collection: {e}"));
                return Err(e);
            }
        };

        if !degraded && (mode == SyncMode::Forced || self.settings.write_through) {
            phase(SyncPhase::WriteCache, &format!("{} hosts", hosts.len()));
            for host in &hosts {
                if let Err(e) = put_json(self.store.as_ref(), &self.buckets.hosts, &host.name, host).await {
                    warn!("cache write for {} skipped: {e}", host.name);
                    degraded = true;
                    break;
                }
            }
        }

        phase(SyncPhase::ReturnResult, &format!("{} hosts", hosts.len()));
        Ok(HostListing { hosts, source: DataSource::Live, degraded })
    }

    /// Nœuds de l'hyperviseur, toujours en live
    pub async fn nodes(&self) -> GridResult<Vec<String>> {
        self.collector.nodes().await
    }

    /// VMs lues directement sur l'hyperviseur, sans lire ni écrire le cache
    pub async fn live_hosts(&self) -> GridResult<Vec<HostRecord>> {
        self.collector.list_hosts().await
    }

    /// Accès runtime d'une VM d'après son record (première adresse privée)
    pub fn access_for(&self, host: &HostRecord) -> GridResult<(String, RuntimeAccess)> {
        let ip = preferred_address(&host.ip, self.resolver.private_prefix()).ok_or_else(|| {
            GridError::HostUnknown(format!("{} has no address in {}", host.name, self.resolver.private_prefix()))
        })?;
        let target = format!("{}@{ip}", self.settings.ssh_user);
        Ok((ip.to_string(), RuntimeAccess::Ssh(target)))
    }

    pub async fn workloads_for(&self, host: &HostRecord, mode: SyncMode) -> GridResult<WorkloadFetch> {
        self.fetch_workloads(host, mode, true).await
    }

    /// `use_cache = false` : le store est déjà connu HS, ni lecture ni écriture
    async fn fetch_workloads(&self, host: &HostRecord, mode: SyncMode, use_cache: bool) -> GridResult<WorkloadFetch> {
        let bucket = &self.buckets.workloads;
        let mut degraded = !use_cache;

        if mode == SyncMode::OnDemand && use_cache {
            phase(SyncPhase::CheckCache, &host.name);
            match get_json::<Vec<WorkloadRecord>>(self.store.as_ref(), bucket, &host.name).await {
                Ok(workloads) if !workloads.is_empty() => {
                    phase(SyncPhase::ReturnCached, &host.name);
                    return Ok(WorkloadFetch { workloads, source: DataSource::Cache, degraded: false });
                }
                Ok(_) | Err(GridError::NotFound { .. }) => {}
                Err(e) if store_down(&e) => {
                    debug!("cache unavailable for {}: {e}", host.name);
                    degraded = true;
                }
                Err(e) => return Err(e),
            }
        }

        phase(SyncPhase::CollectLive, &host.name);
        let (_, access) = self.access_for(host)?;
        let workloads = match self.collector.list_workloads(&host.name, &access).await {
            Ok(w) => w,
            Err(e) => {
                phase(SyncPhase::Failed, &format!("{}: {e}", host.name));
                return Err(e);
            }
        };

        if !degraded {
            phase(SyncPhase::WriteCache, &host.name);
            if let Err(e) = put_json(self.store.as_ref(), bucket, &host.name, &workloads).await {
                warn!("cache write for {} skipped: {e}", host.name);
                degraded = true;
            }
        }

        phase(SyncPhase::ReturnResult, &host.name);
        Ok(WorkloadFetch { workloads, source: DataSource::Live, degraded })
    }

    /// VMs puis conteneurs de chaque VM démarrée, en parallèle borné
    pub async fn fleet(&self, mode: SyncMode) -> GridResult<FleetReport> {
        let listing = self.hosts(mode).await?;
        let host_timeout = self.settings.host_timeout;
        let use_cache = !listing.degraded;
        let running: Vec<HostRecord> = listing.hosts.iter().filter(|h| h.running).cloned().collect();

        let results: Vec<(HostKey, GridResult<WorkloadFetch>)> = stream::iter(running)
            .map(|host| {
                let ctx = self.clone();
                async move {
                    let address = preferred_address(&host.ip, ctx.resolver.private_prefix()).unwrap_or("").to_string();
                    let fetch = ctx.fetch_workloads(&host, mode, use_cache);
                    let result = match tokio::time::timeout(host_timeout, fetch).await {
                        Ok(r) => r,
                        Err(_) => Err(GridError::Timeout(format!("{} after {host_timeout:?}", host.name))),
                    };
                    (HostKey { name: host.name, address }, result)
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let report = FleetReport::assemble(&listing, results);
        info!(
            "fleet: {} hosts, {} running, {} workloads, {} failures ({:?})",
            report.totals.hosts,
            report.totals.running,
            report.totals.workloads,
            report.failures.len(),
            report.source
        );
        Ok(report)
    }

    /// Collecte live complète, le cache est réécrit
    pub async fn force_sync(&self) -> GridResult<FleetReport> {
        info!("forced sync of fleet {}", self.buckets.hosts);
        self.fleet(SyncMode::Forced).await
    }

    /// Conteneurs d'un hôte désigné par nom, adresse avec schéma, ou `self`
    pub async fn containers(&self, identifier: &str) -> GridResult<(String, Vec<WorkloadRecord>)> {
        let address = match identifier.trim() {
            "" | "self" => "self".to_string(),
            id => self.resolver.resolve(id, &self.settings.ssh_user).await?,
        };
        let access = RuntimeAccess::from_address(&address);
        let label = if identifier.trim().is_empty() { "self" } else { identifier };
        let workloads = self.collector.list_workloads(label, &access).await?;
        Ok((address, workloads))
    }
}
