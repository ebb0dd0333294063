//! Host identifier → runtime access address.
//!
//! A bare host name is looked up in the hosts bucket and turned into an
//! `ssh://user@ip` target using the first private address of the record.
//! Anything that already carries an access scheme is passed through untouched.

use crate::error::{GridError, GridResult};
use crate::models::HostRecord;
use crate::store::{get_json, CacheBuckets, SharedStore};
use tracing::debug;

const ACCESS_SCHEMES: [&str; 5] = ["ssh://", "tcp://", "unix://", "http://", "https://"];

#[derive(Clone)]
pub struct HostResolver {
    store: SharedStore,
    buckets: CacheBuckets,
    private_prefix: String,
}

impl HostResolver {
    pub fn new(store: SharedStore, buckets: CacheBuckets, private_prefix: impl Into<String>) -> Self {
        Self { store, buckets, private_prefix: private_prefix.into() }
    }

    pub fn private_prefix(&self) -> &str {
        &self.private_prefix
    }

    pub async fn resolve(&self, identifier: &str, user: &str) -> GridResult<String> {
        if has_access_scheme(identifier) {
            return Ok(identifier.to_string());
        }

        let host: HostRecord = match get_json(self.store.as_ref(), &self.buckets.hosts, identifier).await {
            Ok(host) => host,
            Err(GridError::NotFound { .. }) => return Err(GridError::HostUnknown(identifier.to_string())),
            Err(e) => return Err(e),
        };

        let ip = preferred_address(&host.ip, &self.private_prefix).ok_or_else(|| {
            GridError::HostUnknown(format!("{identifier} has no address in {}", self.private_prefix))
        })?;
        debug!("resolved {identifier} -> {ip}");
        Ok(format!("ssh://{user}@{ip}"))
    }
}

pub fn has_access_scheme(identifier: &str) -> bool {
    ACCESS_SCHEMES.iter().any(|s| identifier.starts_with(s))
}

/// Première adresse du réseau privé, dans l'ordre du record
pub fn preferred_address<'a>(ips: &'a [String], prefix: &str) -> Option<&'a str> {
    ips.iter().map(String::as_str).find(|ip| ip.starts_with(prefix))
}
