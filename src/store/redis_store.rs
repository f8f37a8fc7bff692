//! Redis store backend for multi-process deployments.

use super::{namespaced, Message, Pipeline, Store, Subscription, NAMESPACE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const SCAN_BATCH: usize = 1000;
const SUBSCRIPTION_BUFFER: usize = 16;

/// Redis-backed [`Store`]. Commands go through a reconnecting connection
/// manager; each subscription holds its own pub/sub connection.
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(backend_err)?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn backend_err(e: redis::RedisError) -> Error {
    Error::backend(e.to_string())
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = namespaced(key);
        let value: Option<Vec<u8>> = self.conn().get(&key).await.map_err(backend_err)?;
        value.ok_or_else(|| Error::not_found(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let key = namespaced(key);
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex(&key, value, ttl.as_secs().max(1))
                .await
                .map_err(backend_err),
            None => conn.set(&key, value).await.map_err(backend_err),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn()
            .del(namespaced(key))
            .await
            .map_err(backend_err)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = keys.iter().map(|k| namespaced(k)).collect();
        self.conn().del(keys).await.map_err(backend_err)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.conn()
            .exists(namespaced(key))
            .await
            .map_err(backend_err)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(namespaced(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await
            .map_err(backend_err)?;
        Ok(acquired.is_some())
    }

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let items: Vec<(String, String)> = fields.into_iter().collect();
        self.conn()
            .hset_multiple(namespaced(key), &items)
            .await
            .map_err(backend_err)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.conn()
            .hgetall(namespaced(key))
            .await
            .map_err(backend_err)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.conn()
            .hincr(namespaced(key), field, delta)
            .await
            .map_err(backend_err)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.conn()
            .lpush(namespaced(key), values)
            .await
            .map_err(backend_err)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .lrem(namespaced(key), 0, value)
            .await
            .map_err(backend_err)
    }

    async fn rotate(&self, key: &str) -> Result<String> {
        let key = namespaced(key);
        let value: Option<String> = self
            .conn()
            .rpoplpush(&key, &key)
            .await
            .map_err(backend_err)?;
        value.ok_or_else(|| Error::not_found(key))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.conn()
            .sadd(namespaced(key), members)
            .await
            .map_err(backend_err)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.conn()
            .srem(namespaced(key), members)
            .await
            .map_err(backend_err)
    }

    async fn spop_n(&self, key: &str, count: usize) -> Result<Vec<String>> {
        redis::cmd("SPOP")
            .arg(namespaced(key))
            .arg(count)
            .query_async(&mut self.conn())
            .await
            .map_err(backend_err)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.conn()
            .publish(namespaced(channel), payload)
            .await
            .map_err(backend_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let name = namespaced(channel);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend_err)?;
        pubsub.subscribe(&name).await.map_err(backend_err)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    next = stream.next() => {
                        let Some(msg) = next else { break };
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("dropping undecodable pub/sub payload: {e}");
                                continue;
                            }
                        };
                        let message = Message {
                            channel: msg.get_channel_name().to_string(),
                            payload,
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx, stop_tx))
    }

    async fn exec_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, fields) in pipeline.hsets {
            let items: Vec<(String, String)> = fields.into_iter().collect();
            pipe.hset_multiple(namespaced(&key), &items).ignore();
        }
        pipe.query_async(&mut self.conn())
            .await
            .map_err(backend_err)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn();
        let pattern = format!("{NAMESPACE}*");
        let mut cursor: u64 = 0;

        // Incremental SCAN keeps the backend responsive on large keyspaces.
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;

            for chunk in keys.chunks(SCAN_BATCH) {
                if !chunk.is_empty() {
                    let _: () = conn.del(chunk.to_vec()).await.map_err(backend_err)?;
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}
