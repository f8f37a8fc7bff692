//! Bulk credential import, delete, and manual validation tasks.

use super::provider::KeyProvider;
use super::tasks::{TaskService, TASK_TIMEOUT};
use crate::channels::{ChannelAdapter, ChannelRegistry, HttpClient};
use crate::crypto::CryptoService;
use crate::domain::{Group, KeyStatus, TaskKind, TaskStatus};
use crate::error::{Error, Result};
use crate::infrastructure::keys;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, warn};

const CHUNK_SIZE: usize = 1000;

/// Tokenise a caller-supplied blob into candidate plaintexts. Tolerates
/// whitespace, commas, and semicolons as separators.
pub fn parse_keys_from_text(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct KeyImportResult {
    pub inserted: usize,
    pub ignored: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct KeyDeleteResult {
    pub deleted: usize,
    pub ignored: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct KeyValidateResult {
    pub valid: usize,
    pub invalid: usize,
}

/// Runs the asynchronous bulk key operations behind the admin surface.
#[derive(Clone)]
pub struct KeyTaskRunner {
    provider: Arc<KeyProvider>,
    tasks: Arc<TaskService>,
    registry: Arc<ChannelRegistry>,
    client: HttpClient,
}

impl KeyTaskRunner {
    pub fn new(
        provider: Arc<KeyProvider>,
        tasks: Arc<TaskService>,
        registry: Arc<ChannelRegistry>,
        client: HttpClient,
    ) -> Self {
        Self {
            provider,
            tasks,
            registry,
            client,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Kick off an import task; returns its initial status immediately.
    pub async fn start_import(&self, group: Group, text: String) -> Result<TaskStatus> {
        let tokens = parse_keys_from_text(&text);
        if tokens.is_empty() {
            return Err(Error::validation("no valid keys found in the input text"));
        }

        let status = self
            .tasks
            .start(TaskKind::KeyImport, &group.name, tokens.len())
            .await?;

        let runner = self.clone();
        tokio::spawn(async move {
            runner
                .drive(group.name.clone(), runner.run_import(group, tokens))
                .await;
        });

        Ok(status)
    }

    /// Kick off a delete task; returns its initial status immediately.
    pub async fn start_delete(&self, group: Group, text: String) -> Result<TaskStatus> {
        let tokens = parse_keys_from_text(&text);
        if tokens.is_empty() {
            return Err(Error::validation("no valid keys found in the input text"));
        }

        let status = self
            .tasks
            .start(TaskKind::KeyDelete, &group.name, tokens.len())
            .await?;

        let runner = self.clone();
        tokio::spawn(async move {
            runner
                .drive(group.name.clone(), runner.run_delete(group, tokens))
                .await;
        });

        Ok(status)
    }

    /// Kick off a validation sweep over every credential of the group.
    pub async fn start_validate(&self, group: Group) -> Result<TaskStatus> {
        let active =
            keys::list_by_status(self.provider.db(), group.id, KeyStatus::Active).await?;
        let cooled =
            keys::list_by_status(self.provider.db(), group.id, KeyStatus::Invalid).await?;
        let total = active.len() + cooled.len();
        if total == 0 {
            return Err(Error::validation("group has no keys to validate"));
        }

        let status = self
            .tasks
            .start(TaskKind::KeyValidate, &group.name, total)
            .await?;

        let runner = self.clone();
        tokio::spawn(async move {
            let all: Vec<_> = active.into_iter().chain(cooled).collect();
            runner
                .drive(group.name.clone(), runner.run_validate(group, all))
                .await;
        });

        Ok(status)
    }

    /// Run a task future under the shared deadline, recording the outcome.
    async fn drive<F>(&self, group_name: String, fut: F)
    where
        F: std::future::Future<Output = Result<serde_json::Value>>,
    {
        match tokio::time::timeout(TASK_TIMEOUT, fut).await {
            Ok(Ok(result)) => {
                if let Err(e) = self.tasks.finish(result).await {
                    error!("failed to record task result for group {group_name}: {e}");
                }
            }
            Ok(Err(e)) => {
                error!("task for group {group_name} failed: {e}");
                if let Err(record_err) = self.tasks.fail(&e.to_string()).await {
                    error!("failed to record task error: {record_err}");
                }
            }
            Err(_) => {
                error!("task for group {group_name} exceeded its deadline");
                if let Err(e) = self.tasks.fail("task deadline exceeded").await {
                    error!("failed to record task timeout: {e}");
                }
            }
        }
    }

    async fn run_import(&self, group: Group, tokens: Vec<String>) -> Result<serde_json::Value> {
        let crypto = self.provider.crypto();

        // In-process dedupe by digest; the unique index takes care of
        // duplicates already stored.
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for token in &tokens {
            let digest = crypto.digest(token);
            if seen.insert(digest.clone()) {
                candidates.push((token.clone(), digest));
            }
        }

        let mut inserted = 0u64;
        let mut processed = 0usize;
        for chunk in candidates.chunks(CHUNK_SIZE) {
            let mut pairs = Vec::with_capacity(chunk.len());
            for (plaintext, digest) in chunk {
                pairs.push((crypto.encrypt(plaintext)?, digest.clone()));
            }

            inserted +=
                keys::insert_ignoring_duplicates(self.provider.db(), group.id, &pairs).await?;
            processed += chunk.len();
            self.tasks.update_progress(processed).await;
        }

        self.refresh_group(&group).await;

        let result = KeyImportResult {
            inserted: inserted as usize,
            ignored: tokens.len() - inserted as usize,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn run_delete(&self, group: Group, tokens: Vec<String>) -> Result<serde_json::Value> {
        let crypto = self.provider.crypto();

        let mut seen = HashSet::new();
        let mut digests = Vec::new();
        for token in &tokens {
            let digest = crypto.digest(token);
            if seen.insert(digest.clone()) {
                digests.push(digest);
            }
        }

        let mut deleted = 0u64;
        let mut processed = 0usize;
        for chunk in digests.chunks(CHUNK_SIZE) {
            deleted += keys::delete_by_hashes(self.provider.db(), group.id, chunk).await?;
            processed += chunk.len();
            self.tasks.update_progress(processed).await;
        }

        self.refresh_group(&group).await;

        let result = KeyDeleteResult {
            deleted: deleted as usize,
            ignored: tokens.len() - deleted as usize,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn run_validate(
        &self,
        group: Group,
        all: Vec<crate::domain::ApiKey>,
    ) -> Result<serde_json::Value> {
        let adapter = self.registry.get(&group.channel_type)?;
        let crypto = self.provider.crypto();

        let mut valid = 0usize;
        let mut invalid = 0usize;

        for (i, key) in all.iter().enumerate() {
            let plaintext = match crypto.decrypt(&key.key_value) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("key {} does not decrypt, marking invalid: {e}", key.id);
                    self.provider.invalidate(&group, key.id).await?;
                    invalid += 1;
                    continue;
                }
            };

            let healthy = matches!(
                adapter.health_probe(&self.client, &plaintext, &group).await,
                Ok(true)
            );

            if healthy {
                valid += 1;
                if key.status == KeyStatus::Invalid {
                    self.provider.promote(&group, key.id).await?;
                }
            } else {
                invalid += 1;
                if key.status == KeyStatus::Active {
                    self.provider.invalidate(&group, key.id).await?;
                }
            }

            self.tasks.update_progress(i + 1).await;
        }

        Ok(serde_json::to_value(KeyValidateResult { valid, invalid })?)
    }

    /// Rebuild the group's pools after a bulk mutation; degraded store
    /// state is logged, not fatal, because the rows are already durable.
    async fn refresh_group(&self, group: &Group) {
        if let Err(e) = self.provider.reload_group(group.id).await {
            warn!("failed to rebuild pool for group {}: {e}", group.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenisation_is_separator_tolerant() {
        let tokens = parse_keys_from_text("sk-aaa, sk-bbb\nsk-ccc;sk-ddd\t sk-eee");
        assert_eq!(tokens, ["sk-aaa", "sk-bbb", "sk-ccc", "sk-ddd", "sk-eee"]);
    }

    #[test]
    fn test_tokenisation_keeps_duplicates() {
        // Dedupe happens digest-side so the ignored count can include
        // in-input repeats.
        let tokens = parse_keys_from_text("sk-aaa, sk-bbb\nsk-aaa");
        assert_eq!(tokens, ["sk-aaa", "sk-bbb", "sk-aaa"]);
    }

    #[test]
    fn test_empty_input_yields_no_tokens() {
        assert!(parse_keys_from_text("  \n\t , ; ").is_empty());
    }
}
