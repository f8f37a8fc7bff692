//! Task status tracking for long-running admin operations.
//!
//! One task runs at a time; its progress record lives in the shared store
//! with a TTL covering the task deadline, so any process can serve status
//! queries.

use crate::domain::{now_ms, TaskKind, TaskStatus};
use crate::error::{Error, Result};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const TASK_KEY: &str = "task:status";

/// Default admin-task deadline; the store TTL is padded past it.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub struct TaskService {
    store: Arc<dyn Store>,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Begin a task; fails with `Conflict` while another one is running.
    pub async fn start(
        &self,
        kind: TaskKind,
        group_name: &str,
        total: usize,
    ) -> Result<TaskStatus> {
        if let Some(existing) = self.get().await? {
            if !existing.finished {
                return Err(Error::Conflict(format!(
                    "task {} for group {} is still running",
                    existing.id, existing.group_name
                )));
            }
        }

        let status = TaskStatus {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            group_name: group_name.to_string(),
            total,
            processed: 0,
            finished: false,
            started_at: now_ms(),
            finished_at: None,
            result: None,
            error: None,
        };
        self.put(&status).await?;
        Ok(status)
    }

    /// Best-effort progress update.
    pub async fn update_progress(&self, processed: usize) {
        let Ok(Some(mut status)) = self.get().await else {
            return;
        };
        status.processed = processed;
        if let Err(e) = self.put(&status).await {
            warn!("failed to update task progress: {e}");
        }
    }

    pub async fn finish(&self, result: serde_json::Value) -> Result<()> {
        let Some(mut status) = self.get().await? else {
            return Ok(());
        };
        status.finished = true;
        status.finished_at = Some(now_ms());
        status.processed = status.total;
        status.result = Some(result);
        self.put(&status).await
    }

    pub async fn fail(&self, error: &str) -> Result<()> {
        let Some(mut status) = self.get().await? else {
            return Ok(());
        };
        status.finished = true;
        status.finished_at = Some(now_ms());
        status.error = Some(error.to_string());
        self.put(&status).await
    }

    pub async fn get(&self) -> Result<Option<TaskStatus>> {
        match self.store.get(TASK_KEY).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, status: &TaskStatus) -> Result<()> {
        self.store
            .set(
                TASK_KEY,
                &serde_json::to_vec(status)?,
                Some(TASK_TIMEOUT + Duration::from_secs(60)),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_single_task_at_a_time() {
        let service = TaskService::new(Arc::new(MemoryStore::new()));

        service
            .start(TaskKind::KeyImport, "g1", 100)
            .await
            .unwrap();
        assert!(matches!(
            service.start(TaskKind::KeyDelete, "g1", 5).await,
            Err(Error::Conflict(_))
        ));

        service.finish(serde_json::json!({"ok": true})).await.unwrap();
        assert!(service.start(TaskKind::KeyDelete, "g1", 5).await.is_ok());
    }

    #[tokio::test]
    async fn test_progress_and_result_roundtrip() {
        let service = TaskService::new(Arc::new(MemoryStore::new()));
        service
            .start(TaskKind::KeyImport, "g1", 10)
            .await
            .unwrap();

        service.update_progress(4).await;
        let status = service.get().await.unwrap().unwrap();
        assert_eq!(status.processed, 4);
        assert!(!status.finished);

        service
            .finish(serde_json::json!({"inserted": 7}))
            .await
            .unwrap();
        let status = service.get().await.unwrap().unwrap();
        assert!(status.finished);
        assert_eq!(status.processed, status.total);
        assert_eq!(status.result.unwrap()["inserted"], 7);
    }
}
