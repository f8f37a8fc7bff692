//! Periodic recuperation of cooled-down credentials.
//!
//! A single leader per tick (elected through a store lock) draws a batch
//! from each group's cooldown set, health-probes the members, and promotes
//! the ones that answer 2xx back into the active ring.

use super::provider::KeyProvider;
use crate::channels::{ChannelAdapter, ChannelRegistry, HttpClient};
use crate::crypto::CryptoService;
use crate::domain::Group;
use crate::error::Result;
use crate::infrastructure::{groups, keys};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const LEADER_LOCK_KEY: &str = "lock:recuperate";

pub struct Recuperator {
    provider: Arc<KeyProvider>,
    registry: Arc<ChannelRegistry>,
    client: HttpClient,
    interval: Duration,
    batch: usize,
}

impl Recuperator {
    pub fn new(
        provider: Arc<KeyProvider>,
        registry: Arc<ChannelRegistry>,
        client: HttpClient,
        interval: Duration,
        batch: usize,
    ) -> Self {
        Self {
            provider,
            registry,
            client,
            interval,
            batch,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            match self.elect_leader().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("another instance holds the recuperation lease");
                    continue;
                }
                Err(e) => {
                    warn!("recuperation leader election failed: {e}");
                    continue;
                }
            }

            if let Err(e) = self.run_once().await {
                warn!("recuperation tick failed: {e}");
            }
            self.release_leadership().await;
        }
    }

    /// Contend the well-known lock; the TTL outlives the tick so a crashed
    /// leader cannot wedge recuperation forever.
    async fn elect_leader(&self) -> Result<bool> {
        self.provider
            .store()
            .set_nx(
                LEADER_LOCK_KEY,
                b"1",
                self.interval + Duration::from_secs(30),
            )
            .await
    }

    async fn release_leadership(&self) {
        if let Err(e) = self.provider.store().delete(LEADER_LOCK_KEY).await {
            warn!("failed to release recuperation lease: {e}");
        }
    }

    /// One recuperation pass over every group.
    pub async fn run_once(&self) -> Result<()> {
        for group in groups::list(self.provider.db()).await? {
            if let Err(e) = self.recuperate_group(&group).await {
                warn!("recuperation failed for group {}: {e}", group.name);
            }
        }
        Ok(())
    }

    async fn recuperate_group(&self, group: &Group) -> Result<()> {
        let batch = self
            .provider
            .draw_cooldown_batch(group.id, self.batch)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }

        let adapter = self.registry.get(&group.channel_type)?;
        let crypto = self.provider.crypto();
        let mut promoted = 0usize;

        for key_id in batch {
            let Some(key) = keys::find_by_id(self.provider.db(), key_id).await? else {
                debug!("cooldown member {key_id} no longer exists, dropping");
                continue;
            };

            let plaintext = match crypto.decrypt(&key.key_value) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("cooldown key {key_id} does not decrypt: {e}");
                    self.provider.return_to_cooldown(group.id, key_id).await?;
                    continue;
                }
            };

            match adapter.health_probe(&self.client, &plaintext, group).await {
                Ok(true) => {
                    self.provider.promote(group, key_id).await?;
                    promoted += 1;
                }
                Ok(false) => {
                    debug!("key {key_id} answered 2xx with an error envelope, keeping cooled");
                    self.provider.return_to_cooldown(group.id, key_id).await?;
                }
                Err(e) => {
                    debug!("key {key_id} still unhealthy: {e}");
                    self.provider.return_to_cooldown(group.id, key_id).await?;
                }
            }
        }

        if promoted > 0 {
            info!("recuperated {promoted} credentials for group {}", group.name);
        }
        Ok(())
    }
}
