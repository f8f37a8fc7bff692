//! Fire-and-forget request logging: one row per finalised attempt plus the
//! hourly counter bump. Database trouble here never blocks a response.

use crate::domain::RequestLog;
use crate::infrastructure::{logs, Database};
use tracing::warn;

#[derive(Clone)]
pub struct RequestLogger {
    db: Database,
}

impl RequestLogger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist the log row and bump the (hour, group) counters off the hot
    /// path.
    pub fn record(&self, group_id: i64, log: RequestLog) {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = logs::insert(&db, &log).await {
                warn!("failed to persist request log {}: {e}", log.id);
            }
            if let Err(e) =
                logs::bump_hourly_stat(&db, group_id, log.timestamp, log.is_success).await
            {
                warn!("failed to bump hourly stats for group {group_id}: {e}");
            }
        });
    }
}
