//! Core domain types: groups, credentials, request logs, and admin tasks.

pub mod group;
pub mod key;
pub mod log;
pub mod task;

pub use group::{Group, GroupName, HeaderAction, HeaderRule, Upstream};
pub use key::{ApiKey, KeyStatus};
pub use log::{HourlyStat, RequestLog, RequestType};
pub use task::{TaskKind, TaskStatus};

/// Current wall-clock time as unix milliseconds; the storage representation
/// for every timestamp column.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
