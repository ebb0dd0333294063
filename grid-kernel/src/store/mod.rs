/**
 * CACHE STORE - Stockage clé/valeur distribué avec expiration (NATS JetStream KV)
 *
 * RÔLE :
 * Couche la plus basse du coeur : persiste les snapshots d'inventaire
 * (VMs et conteneurs) pour que la CLI et l'API n'interrogent pas
 * l'infrastructure à chaque appel.
 *
 * FONCTIONNEMENT :
 * - CacheStore trait = interface commune (put/get/list_keys/close)
 * - Un bucket = un namespace avec un TTL unique pour toutes ses clés
 * - Buckets `<flotte>-vms` et `<flotte>-containers`, pas de collision entre flottes
 * - L'expiration est faite par le store lui-même : clé expirée == NotFound
 *
 * POLITIQUE TTL :
 * La config d'un bucket est fixée à sa création. Un put ultérieur avec un TTL
 * configuré différent ne touche ni le bucket ni la durée de vie des entrées.
 *
 * BACKENDS :
 * - NatsStore : JetStream KV (prod)
 * - MemoryStore : en process, pour le dev local et les tests
 */

use crate::config::NatsConf;
use crate::error::{GridError, GridResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod nats;

pub use memory::MemoryStore;
pub use nats::NatsStore;

/// Configuration appliquée à la création d'un bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    pub ttl: Duration,
    pub replicas: usize,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(30 * 60), replicas: 1 }
    }
}

/// Noms des deux buckets logiques d'une flotte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheBuckets {
    pub hosts: String,
    pub workloads: String,
}

impl CacheBuckets {
    pub fn for_fleet(fleet: &str) -> Self {
        Self {
            hosts: format!("{fleet}-vms"),
            workloads: format!("{fleet}-containers"),
        }
    }
}

/// Interface commune des backends de cache.
/// Chaque opération vérifie la connexion avant tout (pas de no-op silencieux).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Écrit (ou écrase) une clé ; crée le bucket avec la politique du store s'il n'existe pas
    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> GridResult<()>;

    /// Lit une clé : payload complet ou `NotFound` (absente, expirée, ou bucket inexistant)
    async fn get(&self, bucket: &str, key: &str) -> GridResult<Vec<u8>>;

    /// Clés vivantes du bucket, triées ; bucket inexistant = liste vide
    async fn list_keys(&self, bucket: &str) -> GridResult<Vec<String>>;

    /// Libère la connexion ; les appels suivants échouent en `StoreUnavailable`
    async fn close(&self);

    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn CacheStore>;

/// Sérialise en JSON puis écrit
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn CacheStore,
    bucket: &str,
    key: &str,
    value: &T,
) -> GridResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|source| GridError::Corrupt {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    })?;
    store.put(bucket, key, bytes).await
}

/// Lit puis désérialise ; un payload illisible est une erreur dure, jamais un miss
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CacheStore,
    bucket: &str,
    key: &str,
) -> GridResult<T> {
    let bytes = store.get(bucket, key).await?;
    serde_json::from_slice(&bytes).map_err(|source| GridError::Corrupt {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    })
}

/// Ouvre le backend désigné par l'URL : `memory://` pour le dev local, NATS sinon
pub async fn open_store(conf: &NatsConf) -> GridResult<SharedStore> {
    let policy = BucketPolicy { ttl: conf.ttl(), replicas: conf.replicas.max(1) };
    if conf.url.starts_with("memory://") {
        tracing::warn!("using in-process cache store, nothing is shared between runs");
        return Ok(Arc::new(MemoryStore::new(policy)));
    }
    let store = NatsStore::connect(conf, policy).await?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostRecord;

    #[test]
    fn test_bucket_names_namespaced_by_fleet() {
        let lab = CacheBuckets::for_fleet("lab");
        assert_eq!(lab.hosts, "lab-vms");
        assert_eq!(lab.workloads, "lab-containers");
        assert_ne!(CacheBuckets::for_fleet("prod").hosts, lab.hosts);
    }

    #[tokio::test]
    async fn test_json_roundtrip_is_byte_identical() {
        let store = MemoryStore::new(BucketPolicy::default());
        let host = HostRecord::new("alpha", true, 3600, vec!["192.168.1.10".into()]);
        let written = serde_json::to_vec(&host).unwrap();

        put_json(&store, "lab-vms", "alpha", &host).await.unwrap();
        assert_eq!(store.get("lab-vms", "alpha").await.unwrap(), written);

        let back: HostRecord = get_json(&store, "lab-vms", "alpha").await.unwrap();
        assert_eq!(back, host);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_hard_error() {
        let store = MemoryStore::new(BucketPolicy::default());
        store.put("lab-vms", "alpha", b"{\"Name\":".to_vec()).await.unwrap();
        let res = get_json::<HostRecord>(&store, "lab-vms", "alpha").await;
        assert!(matches!(res, Err(GridError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_open_memory_backend() {
        let conf = NatsConf { url: "memory://".into(), ..NatsConf::default() };
        let store = open_store(&conf).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
    }
}
