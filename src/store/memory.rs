//! In-process store backend with background expiration.

use super::{namespaced, Message, Pipeline, Store, Subscription, NAMESPACE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SUBSCRIPTION_BUFFER: usize = 16;

#[derive(Default)]
struct MemoryState {
    kv: HashMap<String, (Vec<u8>, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    /// Drop expired kv entries; other collections carry no TTL.
    fn sweep(&mut self, now: Instant) {
        self.kv
            .retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
    }

    fn live_kv(&self, key: &str) -> Option<&Vec<u8>> {
        match self.kv.get(key) {
            Some((value, deadline)) if deadline.map_or(true, |d| d > Instant::now()) => Some(value),
            _ => None,
        }
    }
}

/// Single-process [`Store`] backend. Pub/sub fans out through per-channel
/// broadcast senders, so peers within the process observe the same
/// invalidation messages a Redis deployment would.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        spawn_sweeper(Arc::downgrade(&state));

        Self {
            state,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Message> {
        let mut channels = self.channels.lock().expect("store channel registry poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .clone()
    }
}

fn spawn_sweeper(state: Weak<Mutex<MemoryState>>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            state.lock().expect("store state poisoned").sweep(Instant::now());
        }
    });
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = namespaced(key);
        let state = self.state.lock().expect("store state poisoned");
        state
            .live_kv(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        let mut state = self.state.lock().expect("store state poisoned");
        state.kv.insert(namespaced(key), (value.to_vec(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = namespaced(key);
        let mut state = self.state.lock().expect("store state poisoned");
        state.kv.remove(&key);
        state.hashes.remove(&key);
        state.lists.remove(&key);
        state.sets.remove(&key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        for key in keys {
            let key = namespaced(key);
            state.kv.remove(&key);
            state.hashes.remove(&key);
            state.lists.remove(&key);
            state.sets.remove(&key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = namespaced(key);
        let state = self.state.lock().expect("store state poisoned");
        Ok(state.live_kv(&key).is_some()
            || state.hashes.contains_key(&key)
            || state.lists.contains_key(&key)
            || state.sets.contains_key(&key))
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let key = namespaced(key);
        let mut state = self.state.lock().expect("store state poisoned");
        if state.live_kv(&key).is_some() {
            return Ok(false);
        }
        state
            .kv
            .insert(key, (value.to_vec(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        state
            .hashes
            .entry(namespaced(key))
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state.hashes.get(&namespaced(key)).cloned().unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut state = self.state.lock().expect("store state poisoned");
        let hash = state.hashes.entry(namespaced(key)).or_default();
        let current = hash
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        let list = state.lists.entry(namespaced(key)).or_default();
        for value in values {
            list.push_front(value.clone());
        }
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        if let Some(list) = state.lists.get_mut(&namespaced(key)) {
            list.retain(|v| v != value);
        }
        Ok(())
    }

    async fn rotate(&self, key: &str) -> Result<String> {
        let key = namespaced(key);
        let mut state = self.state.lock().expect("store state poisoned");
        let list = state
            .lists
            .get_mut(&key)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::not_found(key.clone()))?;

        let value = list.pop_back().expect("checked non-empty");
        list.push_front(value.clone());
        Ok(value)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        state
            .sets
            .entry(namespaced(key))
            .or_default()
            .extend(members.iter().cloned());
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        if let Some(set) = state.sets.get_mut(&namespaced(key)) {
            for member in members {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn spop_n(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock().expect("store state poisoned");
        let Some(set) = state.sets.get_mut(&namespaced(key)) else {
            return Ok(Vec::new());
        };

        let picked: Vec<String> = set.iter().take(count).cloned().collect();
        for member in &picked {
            set.remove(member);
        }
        Ok(picked)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let name = namespaced(channel);
        let message = Message {
            channel: name.clone(),
            payload: payload.to_vec(),
        };
        // A send error only means there are no subscribers right now.
        let _ = self.sender(&name).send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut broadcast_rx = self.sender(&namespaced(channel)).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    received = broadcast_rx.recv() => match received {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Subscription::new(rx, stop_tx))
    }

    async fn exec_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        for (key, fields) in pipeline.hsets {
            self.hset_all(&key, fields).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().expect("store state poisoned");
        state.kv.retain(|k, _| !k.starts_with(NAMESPACE));
        state.hashes.retain(|k, _| !k.starts_with(NAMESPACE));
        state.lists.retain(|k, _| !k.starts_with(NAMESPACE));
        state.sets.retain(|k, _| !k.starts_with(NAMESPACE));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("absent").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v");
        assert!(store.exists("k").await.unwrap());

        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", b"v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_set_nx_locks_once() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("lock", b"1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_nx("lock", b"2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rotate_is_round_robin() {
        let store = MemoryStore::new();
        // LPUSH in id order: the first rotate returns the first pushed value.
        store
            .lpush(
                "ring",
                &["k1".to_string(), "k2".to_string(), "k3".to_string()],
            )
            .await
            .unwrap();

        let picks: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..6 {
                out.push(store.rotate("ring").await.unwrap());
            }
            out
        };
        assert_eq!(picks, ["k1", "k2", "k3", "k1", "k2", "k3"]);
    }

    #[tokio::test]
    async fn test_rotate_empty_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.rotate("ring").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lrem_removes_member() {
        let store = MemoryStore::new();
        store
            .lpush("ring", &["k1".to_string(), "k2".to_string()])
            .await
            .unwrap();
        store.lrem("ring", "k1").await.unwrap();
        assert_eq!(store.rotate("ring").await.unwrap(), "k2");
        assert_eq!(store.rotate("ring").await.unwrap(), "k2");
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        store
            .hset_all(
                "h",
                HashMap::from([("a".to_string(), "1".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(store.hincr_by("h", "a", 2).await.unwrap(), 3);
        assert_eq!(store.hincr_by("h", "fresh", 5).await.unwrap(), 5);

        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.get("a").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_set_ops() {
        let store = MemoryStore::new();
        store
            .sadd("cooldown", &["k1".to_string(), "k2".to_string(), "k3".to_string()])
            .await
            .unwrap();
        store.srem("cooldown", &["k2".to_string()]).await.unwrap();

        let mut popped = store.spop_n("cooldown", 10).await.unwrap();
        popped.sort();
        assert_eq!(popped, ["k1", "k3"]);
        assert!(store.spop_n("cooldown", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pubsub_roundtrip() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("events").await.unwrap();
        store.publish("events", b"hello").await.unwrap();

        let message = sub.next().await.unwrap();
        assert_eq!(message.payload, b"hello");
        assert!(message.channel.starts_with(NAMESPACE));

        sub.close();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_commits_all_hsets() {
        let store = MemoryStore::new();
        let mut pipeline = Pipeline::new();
        pipeline.hset_all("k1", HashMap::from([("f".to_string(), "1".to_string())]));
        pipeline.hset_all("k2", HashMap::from([("f".to_string(), "2".to_string())]));
        store.exec_pipeline(pipeline).await.unwrap();

        assert_eq!(
            store.hgetall("k1").await.unwrap().get("f").map(String::as_str),
            Some("1")
        );
        assert_eq!(
            store.hgetall("k2").await.unwrap().get("f").map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_clear_removes_namespace() {
        let store = MemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        store.lpush("ring", &["k1".to_string()]).await.unwrap();
        store.clear().await.unwrap();

        assert!(store.get("k").await.is_err());
        assert!(store.rotate("ring").await.is_err());
    }
}
