//! The credential provider: acquisition, feedback, and pool maintenance.

use super::{
    active_ring_key, cooldown_key, invalidated_channel, key_state_key, reloaded_channel,
    FailureKind,
};
use crate::crypto::CryptoService;
use crate::domain::{now_ms, ApiKey, Group, KeyStatus};
use crate::error::{Error, Result};
use crate::infrastructure::{groups, keys, Database};
use crate::store::{Pipeline, Store};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A credential selected for one upstream attempt. Carries the decrypted
/// plaintext; never persisted in this form.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: i64,
    pub group_id: i64,
    pub key_hash: String,
    pub plaintext: String,
}

/// Rotating per-group credential pools over the shared store, with the
/// database as the authoritative record.
pub struct KeyProvider {
    db: Database,
    store: Arc<dyn Store>,
    crypto: Arc<dyn CryptoService>,
}

impl KeyProvider {
    pub fn new(db: Database, store: Arc<dyn Store>, crypto: Arc<dyn CryptoService>) -> Self {
        Self { db, store, crypto }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoService> {
        &self.crypto
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Atomically rotate the group's active ring and return the credential
    /// moved to the head. Strict round-robin within a backend round-trip.
    pub async fn take(&self, group: &Group) -> Result<SelectedKey> {
        let ring = active_ring_key(group.id);

        // A rotated id can be stale (deleted key); skip past a few before
        // declaring the pool empty.
        for _ in 0..3 {
            let key_id = match self.store.rotate(&ring).await {
                Ok(id) => id,
                Err(e) if e.is_not_found() => return Err(Error::no_keys(&group.name)),
                Err(e) => return Err(e),
            };

            let id: i64 = match key_id.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!("dropping malformed ring entry {key_id} for group {}", group.name);
                    self.store.lrem(&ring, &key_id).await?;
                    continue;
                }
            };

            let state = self.store.hgetall(&key_state_key(id)).await?;
            let encrypted = match state.get("key_value") {
                Some(value) => value.clone(),
                None => match keys::find_by_id(&self.db, id).await? {
                    Some(key) if key.status == KeyStatus::Active => {
                        self.cache_key_state(&key).await?;
                        key.key_value
                    }
                    _ => {
                        debug!("evicting stale ring entry {id} for group {}", group.name);
                        self.store.lrem(&ring, &key_id).await?;
                        continue;
                    }
                },
            };

            let plaintext = self.crypto.decrypt(&encrypted)?;
            let key_hash = state
                .get("key_hash")
                .cloned()
                .unwrap_or_else(|| self.crypto.digest(&plaintext));

            return Ok(SelectedKey {
                id,
                group_id: group.id,
                key_hash,
                plaintext,
            });
        }

        Err(Error::no_keys(&group.name))
    }

    /// Success feedback: reset the failure counter, stamp last use, and
    /// promote the credential back out of cooldown if it was there.
    pub async fn report_success(&self, group: &Group, key: &SelectedKey) -> Result<()> {
        let was_cooled = self
            .store
            .hgetall(&key_state_key(key.id))
            .await?
            .get("status")
            .map(|s| s == KeyStatus::Invalid.as_str())
            .unwrap_or(false);

        // Durable state first; peers reconverge from it.
        keys::mark_success(&self.db, key.id).await?;

        self.store
            .hset_all(
                &key_state_key(key.id),
                HashMap::from([
                    ("failure_count".to_string(), "0".to_string()),
                    ("status".to_string(), KeyStatus::Active.as_str().to_string()),
                    ("last_used_at".to_string(), now_ms().to_string()),
                ]),
            )
            .await?;

        if was_cooled {
            info!(
                "credential {} of group {} recovered by live traffic",
                key.id, group.name
            );
            self.store
                .srem(&cooldown_key(group.id), &[key.id.to_string()])
                .await?;
            self.store
                .lpush(&active_ring_key(group.id), &[key.id.to_string()])
                .await?;
            self.publish_reloaded(group.id).await;
        }

        Ok(())
    }

    /// Failure feedback. `Uncounted` leaves the counter alone; `FatalAuth`
    /// or reaching the group threshold moves the credential into cooldown.
    pub async fn report_failure(
        &self,
        group: &Group,
        key: &SelectedKey,
        kind: FailureKind,
    ) -> Result<()> {
        if kind == FailureKind::Uncounted {
            return Ok(());
        }

        let count = self
            .store
            .hincr_by(&key_state_key(key.id), "failure_count", 1)
            .await?;

        if let Err(e) = keys::record_failure(&self.db, key.id, count).await {
            // Hot path must not block on the database; the counter lives in
            // the store and the row reconverges on the next transition.
            warn!("failed to persist failure count for key {}: {e}", key.id);
        }

        if kind == FailureKind::FatalAuth || count >= group.blacklist_threshold {
            self.blacklist(group, key.id).await?;
        }

        Ok(())
    }

    /// Move a credential from the active ring into cooldown and tell peers.
    /// Idempotent: repeating it keeps the credential cooled down.
    async fn blacklist(&self, group: &Group, key_id: i64) -> Result<()> {
        keys::set_status(&self.db, key_id, KeyStatus::Invalid).await?;

        let member = key_id.to_string();
        self.store.lrem(&active_ring_key(group.id), &member).await?;
        self.store.sadd(&cooldown_key(group.id), &[member]).await?;
        self.store
            .hset_all(
                &key_state_key(key_id),
                HashMap::from([(
                    "status".to_string(),
                    KeyStatus::Invalid.as_str().to_string(),
                )]),
            )
            .await?;

        info!("credential {key_id} of group {} moved to cooldown", group.name);

        let payload = key_id.to_string();
        if let Err(e) = self
            .store
            .publish(&invalidated_channel(group.id), payload.as_bytes())
            .await
        {
            // The write is already durable; peers reconverge on refresh.
            warn!("failed to publish invalidation for key {key_id}: {e}");
        }
        Ok(())
    }

    /// Force a credential into cooldown outside the feedback path (manual
    /// validation).
    pub async fn invalidate(&self, group: &Group, key_id: i64) -> Result<()> {
        self.blacklist(group, key_id).await
    }

    /// Promote a cooled-down credential back into the active ring (used by
    /// the recuperator after a healthy probe).
    pub async fn promote(&self, group: &Group, key_id: i64) -> Result<()> {
        keys::mark_success(&self.db, key_id).await?;

        self.store
            .hset_all(
                &key_state_key(key_id),
                HashMap::from([
                    ("failure_count".to_string(), "0".to_string()),
                    ("status".to_string(), KeyStatus::Active.as_str().to_string()),
                ]),
            )
            .await?;
        self.store
            .srem(&cooldown_key(group.id), &[key_id.to_string()])
            .await?;
        self.store
            .lpush(&active_ring_key(group.id), &[key_id.to_string()])
            .await?;

        info!("credential {key_id} of group {} recuperated", group.name);
        self.publish_reloaded(group.id).await;
        Ok(())
    }

    /// Return a cooled-down credential to the cooldown set after a failed
    /// probe (the recuperation batch popped it).
    pub async fn return_to_cooldown(&self, group_id: i64, key_id: i64) -> Result<()> {
        self.store
            .sadd(&cooldown_key(group_id), &[key_id.to_string()])
            .await
    }

    /// Draw up to `count` cooldown members for a recuperation batch.
    pub async fn draw_cooldown_batch(&self, group_id: i64, count: usize) -> Result<Vec<i64>> {
        let drawn = self.store.spop_n(&cooldown_key(group_id), count).await?;
        Ok(drawn.iter().filter_map(|id| id.parse().ok()).collect())
    }

    /// Rebuild one group's pools from the database: active credentials in
    /// id order into the ring, invalid ones into the cooldown set.
    pub async fn rebuild_group(&self, group: &Group) -> Result<()> {
        let active = keys::list_by_status(&self.db, group.id, KeyStatus::Active).await?;
        let cooled = keys::list_by_status(&self.db, group.id, KeyStatus::Invalid).await?;

        self.store
            .delete_many(&[active_ring_key(group.id), cooldown_key(group.id)])
            .await?;

        let mut pipeline = Pipeline::new();
        for key in active.iter().chain(cooled.iter()) {
            pipeline.hset_all(&key_state_key(key.id), key_state_fields(key));
        }
        self.store.exec_pipeline(pipeline).await?;

        if !active.is_empty() {
            let ids: Vec<String> = active.iter().map(|k| k.id.to_string()).collect();
            self.store.lpush(&active_ring_key(group.id), &ids).await?;
        }
        if !cooled.is_empty() {
            let ids: Vec<String> = cooled.iter().map(|k| k.id.to_string()).collect();
            self.store.sadd(&cooldown_key(group.id), &ids).await?;
        }

        debug!(
            "rebuilt pool for group {}: {} active, {} cooling down",
            group.name,
            active.len(),
            cooled.len()
        );
        Ok(())
    }

    /// Rebuild every group's pools; startup and full-refresh path.
    pub async fn rebuild_all(&self) -> Result<()> {
        for group in groups::list(&self.db).await? {
            self.rebuild_group(&group).await?;
        }
        Ok(())
    }

    /// Rebuild one group by id, announcing the reload to peers.
    pub async fn reload_group(&self, group_id: i64) -> Result<()> {
        let group = groups::find_by_id(&self.db, group_id).await?;
        self.rebuild_group(&group).await?;
        self.publish_reloaded(group_id).await;
        Ok(())
    }

    /// Drop a deleted group's pool state from the store.
    pub async fn forget_group(&self, group_id: i64) {
        if let Err(e) = self
            .store
            .delete_many(&[active_ring_key(group_id), cooldown_key(group_id)])
            .await
        {
            warn!("failed to drop pool state for group {group_id}: {e}");
        }
    }

    async fn cache_key_state(&self, key: &ApiKey) -> Result<()> {
        self.store
            .hset_all(&key_state_key(key.id), key_state_fields(key))
            .await
    }

    async fn publish_reloaded(&self, group_id: i64) {
        if let Err(e) = self
            .store
            .publish(&reloaded_channel(group_id), group_id.to_string().as_bytes())
            .await
        {
            warn!("failed to publish reload for group {group_id}: {e}");
        }
    }
}

fn key_state_fields(key: &ApiKey) -> HashMap<String, String> {
    HashMap::from([
        ("key_value".to_string(), key.key_value.clone()),
        ("key_hash".to_string(), key.key_hash.clone()),
        ("status".to_string(), key.status.as_str().to_string()),
        (
            "failure_count".to_string(),
            key.failure_count.to_string(),
        ),
    ])
}
