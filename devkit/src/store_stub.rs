/*!
Store muet

Simule un serveur NATS joignable mais qui ne répond plus : chaque opération
échoue en `Timeout` après `stall`, comme le ferait NatsStore une fois son
délai d'opération écoulé.
*/

use async_trait::async_trait;
use grid_kernel::error::{GridError, GridResult};
use grid_kernel::store::CacheStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub struct StalledStore {
    stall: Duration,
    attempts: AtomicUsize,
}

impl StalledStore {
    pub fn new(stall: Duration) -> Self {
        Self { stall, attempts: AtomicUsize::new(0) }
    }

    /// Opérations tentées (lectures et écritures)
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn stalled<T>(&self, what: &str) -> GridResult<T> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.stall).await;
        Err(GridError::Timeout(format!("stalled {what} after {:?}", self.stall)))
    }
}

#[async_trait]
impl CacheStore for StalledStore {
    async fn put(&self, bucket: &str, _key: &str, _value: Vec<u8>) -> GridResult<()> {
        self.stalled(&format!("put {bucket}")).await
    }

    async fn get(&self, bucket: &str, _key: &str) -> GridResult<Vec<u8>> {
        self.stalled(&format!("get {bucket}")).await
    }

    async fn list_keys(&self, bucket: &str) -> GridResult<Vec<String>> {
        self.stalled(&format!("keys {bucket}")).await
    }

    async fn close(&self) {}

    fn backend_name(&self) -> &'static str {
        "stalled"
    }
}
