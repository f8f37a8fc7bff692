//! Cross-process coordination layer: key-value cache, distributed locks,
//! and change notifications.
//!
//! One contract, two interchangeable backends: an in-process map with
//! background expiration for single-node deployments, and Redis for
//! multi-process deployments. Every key and channel name is transparently
//! prefixed with the application namespace.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Prefix applied to every key and channel owned by this application.
pub const NAMESPACE: &str = "gpt-load:";

/// A message received on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// A cooperatively closable pub/sub subscription.
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    stop: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Message>, stop: oneshot::Sender<()>) -> Self {
        Self {
            rx,
            stop: Some(stop),
        }
    }

    /// Receive the next message; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Close the subscription; the backing task stops forwarding.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Buffered HSET operations committed in one backend round-trip.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub(crate) hsets: Vec<(String, HashMap<String, String>)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset_all(&mut self, key: &str, fields: HashMap<String, String>) {
        self.hsets.push((key.to_string(), fields));
    }

    pub fn is_empty(&self) -> bool {
        self.hsets.is_empty()
    }
}

/// Key-value, hash, list, set, and pub/sub operations shared by all
/// backends. `get` on a missing key fails with [`crate::Error::NotFound`],
/// never a generic error.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_many(&self, keys: &[String]) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Set the key only if absent; the building block for distributed locks.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()>;
    async fn lrem(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically pop the list tail, push it back onto the head, and return
    /// it. [`crate::Error::NotFound`] when the list is empty.
    async fn rotate(&self, key: &str) -> Result<String>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<()>;

    /// Pop up to `count` random members from a set.
    async fn spop_n(&self, key: &str, count: usize) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    async fn exec_pipeline(&self, pipeline: Pipeline) -> Result<()>;

    /// Remove every key under the application namespace without pausing the
    /// backend; other applications' data is preserved.
    async fn clear(&self) -> Result<()>;
}

pub(crate) fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}{key}")
}
