//! Pub/sub consumer keeping this process's pools converged with its peers.
//!
//! Subscriptions cover the fixed channels (`cache:cleared`) plus the
//! per-group invalidation and reload channels; the set is rebuilt every
//! refresh cycle so newly created groups get picked up, and each cycle ends
//! with a full pool refresh from the database.

use super::provider::KeyProvider;
use super::{invalidated_channel, reloaded_channel, CACHE_CLEARED_CHANNEL};
use crate::infrastructure::groups;
use crate::store::{Message, Store, NAMESPACE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

const LISTENER_BUFFER: usize = 64;

pub struct PoolListener {
    provider: Arc<KeyProvider>,
    refresh_interval: Duration,
}

impl PoolListener {
    pub fn new(provider: Arc<KeyProvider>, refresh_interval: Duration) -> Self {
        Self {
            provider,
            refresh_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let channels = match self.channel_names().await {
                Ok(channels) => channels,
                Err(e) => {
                    warn!("listener cannot enumerate groups: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let (tx, mut rx) = mpsc::channel::<Message>(LISTENER_BUFFER);
            let mut forwarders = Vec::new();
            for channel in channels {
                match self.provider.store().subscribe(&channel).await {
                    Ok(mut subscription) => {
                        let tx = tx.clone();
                        forwarders.push(tokio::spawn(async move {
                            while let Some(message) = subscription.next().await {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                        }));
                    }
                    Err(e) => warn!("failed to subscribe to {channel}: {e}"),
                }
            }
            drop(tx);

            let cycle_end = tokio::time::sleep(self.refresh_interval);
            tokio::pin!(cycle_end);

            loop {
                tokio::select! {
                    _ = &mut cycle_end => break,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            for forwarder in forwarders {
                                forwarder.abort();
                            }
                            return;
                        }
                    }
                    message = rx.recv() => match message {
                        Some(message) => self.handle(message).await,
                        None => break,
                    },
                }
            }

            for forwarder in forwarders {
                forwarder.abort();
            }

            // Scheduled full refresh: reconverge with the database even if
            // every notification was missed.
            if let Err(e) = self.provider.rebuild_all().await {
                warn!("scheduled pool refresh failed: {e}");
            }
        }
    }

    async fn channel_names(&self) -> crate::error::Result<Vec<String>> {
        let mut channels = vec![CACHE_CLEARED_CHANNEL.to_string()];
        for group in groups::list(self.provider.db()).await? {
            channels.push(invalidated_channel(group.id));
            channels.push(reloaded_channel(group.id));
        }
        Ok(channels)
    }

    async fn handle(&self, message: Message) {
        let name = message
            .channel
            .strip_prefix(NAMESPACE)
            .unwrap_or(&message.channel);

        if name == CACHE_CLEARED_CHANNEL {
            debug!("cache cleared, rebuilding every pool");
            if let Err(e) = self.provider.rebuild_all().await {
                warn!("pool rebuild after cache clear failed: {e}");
            }
            return;
        }

        let group_id = name
            .rsplit(':')
            .next()
            .and_then(|id| id.parse::<i64>().ok());

        let Some(group_id) = group_id else {
            debug!("ignoring message on unrecognised channel {name}");
            return;
        };

        match groups::find_by_id(self.provider.db(), group_id).await {
            Ok(group) => {
                if let Err(e) = self.provider.rebuild_group(&group).await {
                    warn!("pool rebuild for group {group_id} failed: {e}");
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("notification for vanished group {group_id}");
            }
            Err(e) => warn!("cannot load group {group_id} for rebuild: {e}"),
        }
    }
}
