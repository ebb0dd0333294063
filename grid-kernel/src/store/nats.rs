//! NATS JetStream KV backend.
//!
//! Buckets are created on first write with the store's `BucketPolicy`
//! (`max_age` = TTL, replica count). Existing buckets are never reconfigured.
//! Every call is bounded by the configured operation timeout.
//!
//! Only a bucket JetStream reports as missing (stream not found) reads as a
//! cache miss. Any other lookup failure is `StoreUnavailable`.

use super::{BucketPolicy, CacheStore};
use crate::config::NatsConf;
use crate::error::{GridError, GridResult};
use async_nats::connection::State;
use async_nats::jetstream::context::{GetStreamError, GetStreamErrorKind, KeyValueError, KeyValueErrorKind};
use async_nats::jetstream::{self, kv, ErrorCode};
use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::RwLock;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

pub struct NatsStore {
    client: RwLock<Option<async_nats::Client>>,
    policy: BucketPolicy,
    timeout: Duration,
    url: String,
}

impl NatsStore {
    pub async fn connect(conf: &NatsConf, policy: BucketPolicy) -> GridResult<Self> {
        let options = if conf.user.is_empty() {
            async_nats::ConnectOptions::new()
        } else {
            async_nats::ConnectOptions::with_user_and_password(conf.user.clone(), conf.password.clone())
        };

        let client = options
            .name("Grid homelab")
            .connection_timeout(conf.timeout())
            .connect(conf.url.as_str())
            .await
            .map_err(|e| GridError::StoreUnavailable(format!("{}: {e}", conf.url)))?;

        info!("connected to NATS at {} (ttl {:?}, replicas {})", conf.url, policy.ttl, policy.replicas);
        Ok(Self {
            client: RwLock::new(Some(client)),
            policy,
            timeout: conf.timeout(),
            url: conf.url.clone(),
        })
    }

    /// Contexte JetStream ; vérifie explicitement la connexion avant chaque opération
    fn context(&self) -> GridResult<jetstream::Context> {
        let guard = self.client.read();
        let client = guard
            .as_ref()
            .ok_or_else(|| GridError::StoreUnavailable(format!("{}: connection closed", self.url)))?;
        if !matches!(client.connection_state(), State::Connected) {
            return Err(GridError::StoreUnavailable(format!("{}: not connected", self.url)));
        }
        Ok(jetstream::new(client.clone()))
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> GridResult<T>
    where
        F: Future<Output = GridResult<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GridError::Timeout(format!("nats {what} after {:?}", self.timeout)))?
    }

    /// `None` si le bucket n'existe pas encore
    async fn open(&self, js: &jetstream::Context, bucket: &str) -> GridResult<Option<kv::Store>> {
        match js.get_key_value(bucket.to_string()).await {
            Ok(store) => Ok(Some(store)),
            Err(e) if missing_bucket(&e) => Ok(None),
            Err(e) => Err(GridError::StoreUnavailable(format!("open bucket {bucket}: {e}"))),
        }
    }

    async fn open_or_create(&self, js: &jetstream::Context, bucket: &str) -> GridResult<kv::Store> {
        if let Some(store) = self.open(js, bucket).await? {
            return Ok(store);
        }
        debug!("creating bucket {bucket} (ttl {:?})", self.policy.ttl);
        js.create_key_value(kv::Config {
            bucket: bucket.to_string(),
            history: 1,
            max_age: self.policy.ttl,
            num_replicas: self.policy.replicas,
            ..Default::default()
        })
        .await
        .map_err(|e| GridError::StoreUnavailable(format!("create bucket {bucket}: {e}")))
    }
}

#[async_trait]
impl CacheStore for NatsStore {
    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> GridResult<()> {
        let js = self.context()?;
        self.bounded("put", async {
            let store = self.open_or_create(&js, bucket).await?;
            store
                .put(key, value.into())
                .await
                .map_err(|e| GridError::StoreUnavailable(format!("put {bucket}/{key}: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, bucket: &str, key: &str) -> GridResult<Vec<u8>> {
        let js = self.context()?;
        self.bounded("get", async {
            let Some(store) = self.open(&js, bucket).await? else {
                return Err(GridError::not_found(bucket, key));
            };
            match store.get(key.to_string()).await {
                Ok(Some(bytes)) => Ok(bytes.to_vec()),
                Ok(None) => Err(GridError::not_found(bucket, key)),
                Err(e) => Err(GridError::StoreUnavailable(format!("get {bucket}/{key}: {e}"))),
            }
        })
        .await
    }

    async fn list_keys(&self, bucket: &str) -> GridResult<Vec<String>> {
        let js = self.context()?;
        self.bounded("keys", async {
            let Some(store) = self.open(&js, bucket).await? else {
                return Ok(Vec::new());
            };
            let keys = store
                .keys()
                .await
                .map_err(|e| GridError::StoreUnavailable(format!("keys {bucket}: {e}")))?;
            let mut keys: Vec<String> = keys
                .try_collect()
                .await
                .map_err(|e| GridError::StoreUnavailable(format!("keys {bucket}: {e}")))?;
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn close(&self) {
        let client = self.client.write().take();
        if let Some(client) = client {
            // vide les publications en attente avant de lâcher la connexion
            let _ = tokio::time::timeout(self.timeout, client.flush()).await;
            info!("closed NATS connection to {}", self.url);
        }
    }

    fn backend_name(&self) -> &'static str {
        "nats"
    }
}

/// Le bucket n'existe pas (stream KV introuvable côté JetStream)
fn missing_bucket(err: &KeyValueError) -> bool {
    if err.kind() != KeyValueErrorKind::GetBucket {
        return false;
    }
    std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<GetStreamError>())
        .is_some_and(|stream_err| {
            matches!(stream_err.kind(), GetStreamErrorKind::JetStream(js) if js.error_code() == ErrorCode::STREAM_NOT_FOUND)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_failures_other_than_missing_stream_are_not_misses() {
        assert!(!missing_bucket(&KeyValueError::from(KeyValueErrorKind::JetStream)));
        assert!(!missing_bucket(&KeyValueError::from(KeyValueErrorKind::GetBucket)));

        let no_responders = GetStreamError::from(GetStreamErrorKind::Request);
        let err = KeyValueError::with_source(KeyValueErrorKind::GetBucket, no_responders);
        assert!(!missing_bucket(&err));
    }
}
