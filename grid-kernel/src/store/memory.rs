//! In-process implementation of the cache store.
//!
//! Emulates JetStream KV semantics closely enough for local development and tests:
//! bucket-wide TTL fixed at creation, expired keys behave as missing, closing the
//! store makes every later call fail with `StoreUnavailable`.
//!
//! Deadlines use `tokio::time::Instant`, so tests can `pause()`/`advance()` the clock.

use super::{BucketPolicy, CacheStore};
use crate::error::{GridError, GridResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    ttl: Duration,
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct MemoryStore {
    policy: RwLock<BucketPolicy>,
    /// None = connexion fermée
    buckets: RwLock<Option<HashMap<String, Bucket>>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(policy: BucketPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            buckets: RwLock::new(Some(HashMap::new())),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(BucketPolicy { ttl, ..BucketPolicy::default() })
    }

    /// Change the policy used for buckets created from now on
    pub fn set_policy(&self, policy: BucketPolicy) {
        *self.policy.write() = policy;
    }

    /// TTL a bucket was created with, if it exists
    pub fn bucket_ttl(&self, bucket: &str) -> Option<Duration> {
        self.buckets.read().as_ref()?.get(bucket).map(|b| b.ttl)
    }

    /// Number of successful writes since creation
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    fn unavailable() -> GridError {
        GridError::StoreUnavailable("memory store closed".into())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> GridResult<()> {
        let policy = *self.policy.read();
        let mut guard = self.buckets.write();
        let buckets = guard.as_mut().ok_or_else(Self::unavailable)?;

        let slot = buckets.entry(bucket.to_string()).or_insert_with(|| {
            tracing::debug!("creating bucket {bucket} (ttl {:?})", policy.ttl);
            Bucket { ttl: policy.ttl, entries: HashMap::new() }
        });
        if slot.ttl != policy.ttl {
            tracing::debug!("bucket {bucket} keeps ttl {:?}, configured {:?} ignored", slot.ttl, policy.ttl);
        }

        let expires_at = Instant::now() + slot.ttl;
        slot.entries.insert(key.to_string(), Entry { value, expires_at });
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> GridResult<Vec<u8>> {
        let now = Instant::now();
        let mut guard = self.buckets.write();
        let buckets = guard.as_mut().ok_or_else(Self::unavailable)?;

        let Some(b) = buckets.get_mut(bucket) else {
            return Err(GridError::not_found(bucket, key));
        };
        if let Some(entry) = b.entries.get(key) {
            if entry.is_live(now) {
                return Ok(entry.value.clone());
            }
        }
        // expirée (ou absente) : même traitement qu'un miss
        b.entries.remove(key);
        Err(GridError::not_found(bucket, key))
    }

    async fn list_keys(&self, bucket: &str) -> GridResult<Vec<String>> {
        let now = Instant::now();
        let guard = self.buckets.read();
        let buckets = guard.as_ref().ok_or_else(Self::unavailable)?;

        let mut keys: Vec<String> = buckets
            .get(bucket)
            .map(|b| {
                b.entries
                    .iter()
                    .filter(|(_, e)| e.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn close(&self) {
        *self.buckets.write() = None;
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
