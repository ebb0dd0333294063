/**
 * DNS PROVIDERS - Registre des backends DNS et dispatch par nom
 *
 * RÔLE :
 * Une seule API CRUD d'enregistrements DNS, quel que soit le fournisseur
 * (Cloudflare, Google Cloud DNS...). Le registre choisit le backend à
 * chaque requête.
 *
 * FONCTIONNEMENT :
 * - DnsProvider trait = interface commune (list/create/read/update/delete + check_ip_usage)
 * - ProviderRegistry = catalogue nom -> provider, avec au plus un provider par défaut
 * - dispatch : nom explicite → provider ; absent → défaut ; sinon InvalidProvider (400)
 * - check_ip_usage interroge TOUS les providers en parallèle :
 *   premier `true` = réponse immédiate, les requêtes restantes sont abandonnées ;
 *   aucun `true` mais une erreur = première erreur reçue ; sinon `false`
 *
 * CONFIG :
 * Un provider est enregistré si sa section existe dans grid.yaml.
 * Plusieurs `is_default: true` : le dernier enregistré gagne (warning dans les logs).
 */

use crate::config::GridConfig;
use crate::error::{GridError, GridResult};
use crate::models::{DnsEntry, DnsRecord};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod cloudflare;
pub mod gcp;

pub use cloudflare::Cloudflare;
pub use gcp::CloudDns;

/// Timeout des appels HTTP vers les APIs DNS
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Interface commune que chaque fournisseur DNS implémente
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Tous les enregistrements d'une zone
    async fn list_entries(&self, zone: &str) -> GridResult<Vec<DnsEntry>>;

    async fn create_record(&self, zone: &str, record: &DnsRecord) -> GridResult<()>;

    /// Lecture par identifiant natif du backend (opaque)
    async fn read_record(&self, zone: &str, id: &str) -> GridResult<DnsRecord>;

    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> GridResult<()>;

    async fn delete_record(&self, zone: &str, id: &str) -> GridResult<()>;

    /// Vrai si un enregistrement A d'une des zones du compte pointe sur `ip`
    async fn check_ip_usage(&self, ip: &str) -> GridResult<bool>;
}

pub type SharedProvider = Arc<dyn DnsProvider>;

/// Catalogue des providers DNS disponibles, consulté à chaque requête
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, SharedProvider>,
    default: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un provider ; `is_default` remplace le défaut courant
    pub fn register(&mut self, name: &str, provider: SharedProvider, is_default: bool) {
        if self.providers.insert(name.to_string(), provider).is_some() {
            warn!("dns provider {name} registered twice, keeping the last one");
        }
        if is_default {
            if let Some(previous) = self.default.replace(name.to_string()) {
                if previous != name {
                    warn!("default dns provider {previous} replaced by {name}");
                }
            }
        }
        info!("dns provider {name} registered{}", if is_default { " (default)" } else { "" });
    }

    /// Construit le registre depuis les sections `gcp` / `cloudflare` de la config
    pub fn from_config(cfg: &GridConfig) -> GridResult<Self> {
        let mut registry = Self::new();
        if let Some(gcp) = cfg.gcp.as_ref().filter(|g| !g.project_id.is_empty()) {
            registry.register("gcp", Arc::new(CloudDns::new(gcp)?), gcp.is_default);
        }
        if let Some(cf) = cfg.cloudflare.as_ref().filter(|c| !c.api_token.is_empty()) {
            registry.register("cloudflare", Arc::new(Cloudflare::new(cf)?), cf.is_default);
        }
        if registry.providers.is_empty() {
            warn!("no dns provider configured, /dns routes will answer 400");
        }
        Ok(registry)
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Noms enregistrés, triés
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Nom explicite → provider ; absent ou vide → provider par défaut
    pub fn dispatch(&self, name: Option<&str>) -> GridResult<SharedProvider> {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => n,
            None => self
                .default
                .as_deref()
                .ok_or_else(|| GridError::InvalidProvider("no provider given and no default configured".into()))?,
        };
        debug!("dispatching to dns provider {name}");
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| GridError::InvalidProvider(name.to_string()))
    }

    pub async fn list_entries(&self, provider: Option<&str>, zone: &str) -> GridResult<Vec<DnsEntry>> {
        self.dispatch(provider)?.list_entries(zone).await
    }

    pub async fn create_record(&self, provider: Option<&str>, zone: &str, record: &DnsRecord) -> GridResult<()> {
        self.dispatch(provider)?.create_record(zone, record).await
    }

    pub async fn read_record(&self, provider: Option<&str>, zone: &str, id: &str) -> GridResult<DnsRecord> {
        self.dispatch(provider)?.read_record(zone, id).await
    }

    pub async fn update_record(
        &self,
        provider: Option<&str>,
        zone: &str,
        id: &str,
        record: &DnsRecord,
    ) -> GridResult<()> {
        self.dispatch(provider)?.update_record(zone, id, record).await
    }

    pub async fn delete_record(&self, provider: Option<&str>, zone: &str, id: &str) -> GridResult<()> {
        self.dispatch(provider)?.delete_record(zone, id).await
    }

    /// Interroge tous les providers en parallèle, s'arrête au premier positif
    pub async fn check_ip_usage(&self, ip: &str) -> GridResult<bool> {
        let mut pending: FuturesUnordered<_> = self
            .providers
            .iter()
            .map(|(name, provider)| async move { (name, provider.check_ip_usage(ip).await) })
            .collect();

        let mut first_error = None;
        while let Some((name, result)) = pending.next().await {
            match result {
                Ok(true) => {
                    debug!("{ip} in use at {name}");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("ip usage check failed at {name}: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }
}
