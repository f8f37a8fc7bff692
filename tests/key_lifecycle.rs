//! End-to-end credential lifecycle: rotation fairness, blacklist and
//! cooldown, recuperation, and bulk import semantics over an in-memory
//! store and database.

use async_trait::async_trait;
use gpt_load::channels::{build_http_client, ChannelAdapter, ChannelRegistry, HttpClient};
use gpt_load::crypto;
use gpt_load::domain::{Group, KeyStatus, TaskKind, Upstream};
use gpt_load::error::{Error, Result};
use gpt_load::infrastructure::{groups, keys, migrations, Database, Dialect};
use gpt_load::keypool::{
    invalidated_channel, FailureKind, KeyProvider, KeyTaskRunner, Recuperator, SelectedKey,
    TaskService,
};
use gpt_load::store::{MemoryStore, Store};
use http::request::Parts;
use sqlx::any::AnyPoolOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Channel adapter with a controllable probe verdict, for recuperation
/// tests that must not touch the network.
struct StubChannel {
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl ChannelAdapter for StubChannel {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn rewrite_request(&self, _parts: &mut Parts, _api_key: &str, _group: &Group) -> Result<()> {
        Ok(())
    }

    async fn health_probe(
        &self,
        _client: &HttpClient,
        _api_key: &str,
        _group: &Group,
    ) -> Result<bool> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(Error::FatalAuth("[status 401] probe rejected".to_string()))
        }
    }
}

struct Harness {
    db: Database,
    store: Arc<dyn Store>,
    provider: Arc<KeyProvider>,
    registry: Arc<ChannelRegistry>,
    healthy: Arc<AtomicBool>,
    group: Group,
}

async fn harness_with_keys(plaintexts: &[&str]) -> Harness {
    gpt_load::infrastructure::database::install_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let db = Database::from_pool(pool, Dialect::Sqlite);
    migrations::migrate(&db).await.expect("schema");

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let crypto = crypto::new_service("");
    let provider = Arc::new(KeyProvider::new(db.clone(), store.clone(), crypto.clone()));

    let healthy = Arc::new(AtomicBool::new(true));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(StubChannel {
        healthy: healthy.clone(),
    }));
    let registry = Arc::new(registry);

    let group = groups::insert(
        &db,
        &Group {
            id: 0,
            name: "g1".to_string(),
            display_name: String::new(),
            channel_type: "stub".to_string(),
            test_model: "test-model".to_string(),
            upstreams: vec![Upstream {
                url: "https://upstream.example".to_string(),
                weight: 1,
            }],
            header_rules: Vec::new(),
            proxy_keys: String::new(),
            blacklist_threshold: 3,
            max_retries: 3,
            recuperate_on_2xx_envelope: true,
            created_at: 0,
            updated_at: 0,
        },
    )
    .await
    .expect("group");

    if !plaintexts.is_empty() {
        let pairs: Vec<(String, String)> = plaintexts
            .iter()
            .map(|p| (p.to_string(), crypto.digest(p)))
            .collect();
        keys::insert_ignoring_duplicates(&db, group.id, &pairs)
            .await
            .expect("seed keys");
    }
    provider.rebuild_group(&group).await.expect("pool build");

    Harness {
        db,
        store,
        provider,
        registry,
        healthy,
        group,
    }
}

async fn selected_for(h: &Harness, plaintext: &str) -> SelectedKey {
    // Rotate until the wanted credential comes up, then put the rotation
    // back where it started by walking a full ring.
    for _ in 0..16 {
        let key = h.provider.take(&h.group).await.expect("take");
        if key.plaintext == plaintext {
            return key;
        }
    }
    panic!("credential {plaintext} never selected");
}

#[tokio::test]
async fn test_rotation_is_strict_round_robin() {
    let h = harness_with_keys(&["k1", "k2", "k3"]).await;

    let mut picks = Vec::new();
    for _ in 0..6 {
        picks.push(h.provider.take(&h.group).await.unwrap().plaintext);
    }
    assert_eq!(picks, ["k1", "k2", "k3", "k1", "k2", "k3"]);
}

#[tokio::test]
async fn test_empty_pool_fails_fast() {
    let h = harness_with_keys(&[]).await;
    assert!(matches!(
        h.provider.take(&h.group).await,
        Err(Error::NoKeysAvailable { .. })
    ));
}

#[tokio::test]
async fn test_fatal_auth_blacklists_and_publishes() {
    let h = harness_with_keys(&["k1", "k2", "k3"]).await;

    let mut sub = h
        .store
        .subscribe(&invalidated_channel(h.group.id))
        .await
        .unwrap();

    let k1 = selected_for(&h, "k1").await;
    h.provider
        .report_failure(&h.group, &k1, FailureKind::FatalAuth)
        .await
        .unwrap();

    // Status flips to invalid in the authoritative store.
    let row = keys::find_by_id(&h.db, k1.id).await.unwrap().unwrap();
    assert_eq!(row.status, KeyStatus::Invalid);

    // The invalidation notice names the credential.
    let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .expect("invalidation published")
        .unwrap();
    assert_eq!(message.payload, k1.id.to_string().as_bytes());

    // k1 is never selected again.
    for _ in 0..6 {
        let key = h.provider.take(&h.group).await.unwrap();
        assert_ne!(key.plaintext, "k1");
    }
}

#[tokio::test]
async fn test_threshold_blacklist_after_consecutive_failures() {
    let h = harness_with_keys(&["k1", "k2", "k3"]).await;
    let k2 = selected_for(&h, "k2").await;

    for _ in 0..2 {
        h.provider
            .report_failure(&h.group, &k2, FailureKind::Retryable)
            .await
            .unwrap();
        let row = keys::find_by_id(&h.db, k2.id).await.unwrap().unwrap();
        assert_eq!(row.status, KeyStatus::Active);
    }

    // Third consecutive failure crosses the threshold of 3.
    h.provider
        .report_failure(&h.group, &k2, FailureKind::Retryable)
        .await
        .unwrap();
    let row = keys::find_by_id(&h.db, k2.id).await.unwrap().unwrap();
    assert_eq!(row.status, KeyStatus::Invalid);

    for _ in 0..4 {
        let key = h.provider.take(&h.group).await.unwrap();
        assert_ne!(key.plaintext, "k2");
    }
}

#[tokio::test]
async fn test_uncounted_failures_leave_counter_alone() {
    let h = harness_with_keys(&["k1"]).await;
    let k1 = selected_for(&h, "k1").await;

    for _ in 0..5 {
        h.provider
            .report_failure(&h.group, &k1, FailureKind::Uncounted)
            .await
            .unwrap();
    }

    let row = keys::find_by_id(&h.db, k1.id).await.unwrap().unwrap();
    assert_eq!(row.status, KeyStatus::Active);
    assert_eq!(row.failure_count, 0);
}

#[tokio::test]
async fn test_success_resets_failure_counter() {
    let h = harness_with_keys(&["k1", "k2"]).await;
    let k1 = selected_for(&h, "k1").await;

    h.provider
        .report_failure(&h.group, &k1, FailureKind::Retryable)
        .await
        .unwrap();
    h.provider
        .report_failure(&h.group, &k1, FailureKind::Retryable)
        .await
        .unwrap();
    h.provider.report_success(&h.group, &k1).await.unwrap();

    let row = keys::find_by_id(&h.db, k1.id).await.unwrap().unwrap();
    assert_eq!(row.failure_count, 0);
    assert_eq!(row.status, KeyStatus::Active);

    // The reset counter means the threshold needs three fresh failures.
    h.provider
        .report_failure(&h.group, &k1, FailureKind::Retryable)
        .await
        .unwrap();
    let row = keys::find_by_id(&h.db, k1.id).await.unwrap().unwrap();
    assert_eq!(row.status, KeyStatus::Active);
}

#[tokio::test]
async fn test_recuperator_promotes_healthy_credentials() {
    let h = harness_with_keys(&["k1", "k2", "k3"]).await;

    // Cool k2 down, then let the recuperator probe it back.
    let k2 = selected_for(&h, "k2").await;
    h.provider
        .report_failure(&h.group, &k2, FailureKind::FatalAuth)
        .await
        .unwrap();
    assert_eq!(
        keys::find_by_id(&h.db, k2.id).await.unwrap().unwrap().status,
        KeyStatus::Invalid
    );

    h.healthy.store(true, Ordering::SeqCst);
    let recuperator = Recuperator::new(
        h.provider.clone(),
        h.registry.clone(),
        build_http_client(),
        Duration::from_secs(60),
        10,
    );
    recuperator.run_once().await.unwrap();

    let row = keys::find_by_id(&h.db, k2.id).await.unwrap().unwrap();
    assert_eq!(row.status, KeyStatus::Active);
    assert_eq!(row.failure_count, 0);

    // k2 rotates again.
    let mut seen = std::collections::HashSet::new();
    for _ in 0..3 {
        seen.insert(h.provider.take(&h.group).await.unwrap().plaintext);
    }
    assert!(seen.contains("k2"));
}

#[tokio::test]
async fn test_recuperator_keeps_unhealthy_credentials_cooled() {
    let h = harness_with_keys(&["k1", "k2"]).await;

    let k2 = selected_for(&h, "k2").await;
    h.provider
        .report_failure(&h.group, &k2, FailureKind::FatalAuth)
        .await
        .unwrap();

    h.healthy.store(false, Ordering::SeqCst);
    let recuperator = Recuperator::new(
        h.provider.clone(),
        h.registry.clone(),
        build_http_client(),
        Duration::from_secs(60),
        10,
    );
    recuperator.run_once().await.unwrap();

    let row = keys::find_by_id(&h.db, k2.id).await.unwrap().unwrap();
    assert_eq!(row.status, KeyStatus::Invalid);

    // Still in cooldown: a later healthy pass can draw it again.
    h.healthy.store(true, Ordering::SeqCst);
    recuperator.run_once().await.unwrap();
    assert_eq!(
        keys::find_by_id(&h.db, k2.id).await.unwrap().unwrap().status,
        KeyStatus::Active
    );
}

#[tokio::test]
async fn test_import_dedupes_within_input_and_against_existing() {
    let h = harness_with_keys(&["sk-bbb"]).await;

    let tasks = Arc::new(TaskService::new(h.store.clone()));
    let runner = KeyTaskRunner::new(
        h.provider.clone(),
        tasks.clone(),
        h.registry.clone(),
        build_http_client(),
    );

    let status = runner
        .start_import(h.group.clone(), "sk-aaa, sk-bbb\nsk-aaa".to_string())
        .await
        .unwrap();
    assert_eq!(status.kind, TaskKind::KeyImport);
    assert_eq!(status.total, 3);

    let finished = wait_for_task(&tasks).await;
    let result = finished.result.expect("task result");
    assert_eq!(result["inserted"], 1);
    assert_eq!(result["ignored"], 2);

    // Exactly two distinct credentials remain for the group.
    assert_eq!(
        keys::list_by_status(&h.db, h.group.id, KeyStatus::Active)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_bulk_delete_reports_deleted_and_ignored() {
    let h = harness_with_keys(&["k1", "k2", "k3"]).await;

    let tasks = Arc::new(TaskService::new(h.store.clone()));
    let runner = KeyTaskRunner::new(
        h.provider.clone(),
        tasks.clone(),
        h.registry.clone(),
        build_http_client(),
    );

    runner
        .start_delete(h.group.clone(), "k1, k3, not-a-key".to_string())
        .await
        .unwrap();

    let finished = wait_for_task(&tasks).await;
    let result = finished.result.expect("task result");
    assert_eq!(result["deleted"], 2);
    assert_eq!(result["ignored"], 1);

    let remaining = keys::list_by_status(&h.db, h.group.id, KeyStatus::Active)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}

async fn wait_for_task(tasks: &TaskService) -> gpt_load::domain::TaskStatus {
    for _ in 0..100 {
        if let Some(status) = tasks.get().await.unwrap() {
            if status.finished {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task never finished");
}
