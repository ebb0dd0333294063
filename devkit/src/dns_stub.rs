/*!
Mock fournisseur DNS

Zone en mémoire avec ids `{provider}-{n}`, ensemble d'IPs "utilisées" pour
check_ip_usage, latence et panne injectables. Les compteurs permettent de
vérifier quel provider a réellement reçu l'appel.
*/

use async_trait::async_trait;
use grid_kernel::dns::DnsProvider;
use grid_kernel::error::{GridError, GridResult};
use grid_kernel::models::{DnsEntry, DnsRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub struct MockDnsProvider {
    name: String,
    /// (zone, id) -> enregistrement
    records: Mutex<BTreeMap<(String, String), DnsRecord>>,
    used_ips: HashSet<String>,
    delay: Duration,
    failure: Option<String>,
    next_id: AtomicUsize,
    calls: AtomicUsize,
    ip_checks_finished: AtomicUsize,
}

impl MockDnsProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(BTreeMap::new()),
            used_ips: HashSet::new(),
            delay: Duration::ZERO,
            failure: None,
            next_id: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            ip_checks_finished: AtomicUsize::new(0),
        }
    }

    /// Un enregistrement A pointe sur `ip` quelque part chez ce provider
    pub fn using_ip(mut self, ip: &str) -> Self {
        self.used_ips.insert(ip.to_string());
        self
    }

    /// Latence appliquée à check_ip_usage
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// check_ip_usage répond toujours par une erreur provider
    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appels reçus, toutes opérations confondues
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// check_ip_usage allés jusqu'au bout (non abandonnés)
    pub fn ip_checks_finished(&self) -> usize {
        self.ip_checks_finished.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    async fn list_entries(&self, zone: &str) -> GridResult<Vec<DnsEntry>> {
        self.hit();
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|((z, _), _)| z == zone)
            .map(|((z, id), r)| DnsEntry {
                id: id.clone(),
                domain: z.clone(),
                record_type: r.record_type.clone(),
                name: r.name.clone(),
                content: r.content.clone(),
                ttl: r.ttl,
                provider: self.name.clone(),
            })
            .collect())
    }

    async fn create_record(&self, zone: &str, record: &DnsRecord) -> GridResult<()> {
        self.hit();
        let id = format!("{}-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().insert((zone.to_string(), id), record.clone());
        Ok(())
    }

    async fn read_record(&self, zone: &str, id: &str) -> GridResult<DnsRecord> {
        self.hit();
        self.records
            .lock()
            .get(&(zone.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| GridError::not_found(zone, id))
    }

    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> GridResult<()> {
        self.hit();
        match self.records.lock().get_mut(&(zone.to_string(), id.to_string())) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(GridError::not_found(zone, id)),
        }
    }

    async fn delete_record(&self, zone: &str, id: &str) -> GridResult<()> {
        self.hit();
        self.records
            .lock()
            .remove(&(zone.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| GridError::not_found(zone, id))
    }

    async fn check_ip_usage(&self, ip: &str) -> GridResult<bool> {
        self.hit();
        tokio::time::sleep(self.delay).await;
        self.ip_checks_finished.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.failure {
            return Err(GridError::provider(&self.name, reason));
        }
        Ok(self.used_ips.contains(ip))
    }
}
