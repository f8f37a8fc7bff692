//! Credential lifecycle engine.
//!
//! Per group the provider maintains an active ring (ordered, rotatable) and
//! a cooldown set (excluded after failures) in the shared store, so every
//! process working against the same backend sees the same rotation state.
//! The database stays authoritative; pools are rebuilt from it on startup,
//! on invalidation messages, and on the periodic refresh.

mod import;
mod listener;
mod provider;
mod recuperator;
mod tasks;

pub use import::{
    parse_keys_from_text, KeyDeleteResult, KeyImportResult, KeyTaskRunner, KeyValidateResult,
};
pub use listener::PoolListener;
pub use provider::{KeyProvider, SelectedKey};
pub use recuperator::Recuperator;
pub use tasks::TaskService;

/// Failure classification fed back after an upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The upstream rejected the credential itself; cool down immediately.
    FatalAuth,
    /// Transient failure; counts toward the blacklist threshold.
    Retryable,
    /// Recognised noise (quota hints etc.); does not touch the counter.
    Uncounted,
}

/// Store key of a group's active ring.
pub(crate) fn active_ring_key(group_id: i64) -> String {
    format!("group:{group_id}:active_keys")
}

/// Store key of a group's cooldown set.
pub(crate) fn cooldown_key(group_id: i64) -> String {
    format!("group:{group_id}:invalid_keys")
}

/// Store key of one credential's state hash.
pub(crate) fn key_state_key(key_id: i64) -> String {
    format!("key:{key_id}")
}

/// Pub/sub channel announcing a blacklisted credential.
pub fn invalidated_channel(group_id: i64) -> String {
    format!("key:invalidated:{group_id}")
}

/// Pub/sub channel announcing a rebuilt group pool.
pub fn reloaded_channel(group_id: i64) -> String {
    format!("group:reloaded:{group_id}")
}

/// Pub/sub channel announcing a full cache wipe (key migration).
pub const CACHE_CLEARED_CHANNEL: &str = "cache:cleared";
