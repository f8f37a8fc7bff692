//! Forward-only schema migrations.
//!
//! Creates the four tables when absent, then applies the legacy repairs
//! carried over from earlier releases: dropping the obsolete `retries`
//! column and backfilling `key_hash` for rows that predate hashed lookup.

use super::database::{Database, Dialect};
use crate::crypto::{CryptoService, PassthroughCrypto};
use crate::error::Result;
use tracing::{debug, info};

pub async fn migrate(db: &Database) -> Result<()> {
    create_schema(db).await?;
    drop_retries_column(db).await;
    backfill_key_hash(db).await?;
    Ok(())
}

async fn create_schema(db: &Database) -> Result<()> {
    let auto_pk = match db.dialect() {
        Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        Dialect::MySql => "BIGINT PRIMARY KEY AUTO_INCREMENT",
        Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
    };

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS groups (
                id {auto_pk},
                name VARCHAR(255) NOT NULL UNIQUE,
                display_name VARCHAR(255) NOT NULL DEFAULT '',
                channel_type VARCHAR(64) NOT NULL,
                test_model VARCHAR(255) NOT NULL,
                upstreams TEXT NOT NULL,
                header_rules TEXT NOT NULL,
                proxy_keys TEXT NOT NULL,
                blacklist_threshold BIGINT NOT NULL DEFAULT 3,
                max_retries BIGINT NOT NULL DEFAULT 3,
                recuperate_on_2xx_envelope BIGINT NOT NULL DEFAULT 1,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id {auto_pk},
                group_id BIGINT NOT NULL,
                key_value TEXT NOT NULL,
                key_hash VARCHAR(255) NOT NULL DEFAULT '',
                status VARCHAR(32) NOT NULL DEFAULT 'active',
                failure_count BIGINT NOT NULL DEFAULT 0,
                last_used_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )"
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_group_id_key_hash
            ON api_keys (group_id, key_hash)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS request_logs (
            id VARCHAR(36) PRIMARY KEY,
            timestamp BIGINT NOT NULL,
            group_name VARCHAR(255) NOT NULL,
            channel_type VARCHAR(64) NOT NULL,
            model VARCHAR(255) NOT NULL,
            status_code BIGINT NOT NULL,
            is_success BIGINT NOT NULL,
            duration_ms BIGINT NOT NULL,
            error_message TEXT NOT NULL,
            source_ip VARCHAR(64) NOT NULL,
            key_hash VARCHAR(255) NOT NULL,
            request_type VARCHAR(16) NOT NULL
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp
            ON request_logs (timestamp)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_request_logs_key_hash
            ON request_logs (key_hash)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS group_hourly_stats (
            time BIGINT NOT NULL,
            group_id BIGINT NOT NULL,
            success_count BIGINT NOT NULL DEFAULT 0,
            failure_count BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (time, group_id)
        )"
        .to_string(),
    ];

    for statement in &statements {
        // MySQL has no IF NOT EXISTS for indexes; tolerate duplicates there.
        match sqlx::query(statement).execute(db.pool()).await {
            Ok(_) => {}
            Err(e) if db.dialect() == Dialect::MySql && statement.contains("INDEX") => {
                debug!("index creation skipped: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// v1.0.22: the per-key `retries` column moved into group settings. Absent
/// columns make the statement fail, which is the common case and harmless.
async fn drop_retries_column(db: &Database) {
    let statement = match db.dialect() {
        Dialect::Postgres => "ALTER TABLE api_keys DROP COLUMN IF EXISTS retries",
        Dialect::MySql | Dialect::Sqlite => "ALTER TABLE api_keys DROP COLUMN retries",
    };

    if let Err(e) = sqlx::query(statement).execute(db.pool()).await {
        debug!("retries column not dropped (usually already absent): {e}");
    }
}

/// v1.1.0: populate `key_hash` for rows created before hashed lookup.
/// Legacy rows predate encryption, so the unkeyed digest applies.
async fn backfill_key_hash(db: &Database) -> Result<()> {
    const BATCH: i64 = 1000;
    let crypto = PassthroughCrypto;
    let mut repaired = 0u64;

    loop {
        let rows = sqlx::query_as::<_, (i64, String)>(&db.sql(
            "SELECT id, key_value FROM api_keys
             WHERE key_hash IS NULL OR key_hash = ''
             ORDER BY id LIMIT ?",
        ))
        .bind(BATCH)
        .fetch_all(db.pool())
        .await?;

        if rows.is_empty() {
            break;
        }

        for (id, key_value) in rows {
            let hash = crypto.digest(&key_value);
            sqlx::query(&db.sql("UPDATE api_keys SET key_hash = ? WHERE id = ?"))
                .bind(hash)
                .bind(id)
                .execute(db.pool())
                .await?;
            repaired += 1;
        }
    }

    if repaired > 0 {
        info!("backfilled key_hash for {repaired} api_keys rows");
    }
    Ok(())
}
