//! In-flight long-running admin operations, stored in the shared KV store.

use serde::{Deserialize, Serialize};

/// Kind of asynchronous admin task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    KeyImport,
    KeyDelete,
    KeyValidate,
}

/// Progress record for the single in-flight admin task. Serialized as JSON
/// into the KV store with a TTL at least as long as the task deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub kind: TaskKind,
    pub group_name: String,
    pub total: usize,
    pub processed: usize,
    pub finished: bool,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
