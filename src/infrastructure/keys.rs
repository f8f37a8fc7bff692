//! Credential repository. Writes here are the authoritative state; the
//! provider's store-backed pools are rebuilt from these rows.

use super::database::{Database, Dialect};
use crate::domain::{now_ms, ApiKey, KeyStatus};
use crate::error::Result;
use sqlx::any::AnyRow;
use sqlx::Row;

const KEY_COLUMNS: &str =
    "id, group_id, key_value, key_hash, status, failure_count, last_used_at, created_at, updated_at";

fn key_from_row(row: &AnyRow) -> Result<ApiKey> {
    Ok(ApiKey {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        key_value: row.try_get("key_value")?,
        key_hash: row.try_get("key_hash")?,
        status: KeyStatus::parse(&row.try_get::<String, _>("status")?),
        failure_count: row.try_get("failure_count")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// All credentials of a group with the given status, ordered by id; the
/// rebuild order of the active ring.
pub async fn list_by_status(db: &Database, group_id: i64, status: KeyStatus) -> Result<Vec<ApiKey>> {
    let rows = sqlx::query(&db.sql(&format!(
        "SELECT {KEY_COLUMNS} FROM api_keys WHERE group_id = ? AND status = ? ORDER BY id"
    )))
    .bind(group_id)
    .bind(status.as_str())
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(key_from_row).collect()
}

pub async fn find_by_id(db: &Database, id: i64) -> Result<Option<ApiKey>> {
    let row = sqlx::query(&db.sql(&format!(
        "SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"
    )))
    .bind(id)
    .fetch_optional(db.pool())
    .await?;
    row.as_ref().map(key_from_row).transpose()
}

pub async fn count_all(db: &Database) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM api_keys")
        .fetch_one(db.pool())
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn count_by_status(db: &Database, status: KeyStatus) -> Result<i64> {
    let row = sqlx::query(&db.sql("SELECT COUNT(*) AS n FROM api_keys WHERE status = ?"))
        .bind(status.as_str())
        .fetch_one(db.pool())
        .await?;
    Ok(row.try_get("n")?)
}

/// Id-ordered page for stable full-table scans (migration, precheck).
pub async fn page_after(db: &Database, last_id: i64, limit: i64) -> Result<Vec<ApiKey>> {
    let rows = sqlx::query(&db.sql(&format!(
        "SELECT {KEY_COLUMNS} FROM api_keys WHERE id > ? ORDER BY id LIMIT ?"
    )))
    .bind(last_id)
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(key_from_row).collect()
}

/// Sample rows that carry a digest, for encryption-state detection.
pub async fn sample_with_hash(db: &Database, limit: i64) -> Result<Vec<ApiKey>> {
    let rows = sqlx::query(&db.sql(&format!(
        "SELECT {KEY_COLUMNS} FROM api_keys \
         WHERE key_hash IS NOT NULL AND key_hash != '' ORDER BY id LIMIT ?"
    )))
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(key_from_row).collect()
}

/// Insert a chunk of (encrypted value, digest) pairs, silently skipping
/// digests the group already holds. Returns the number actually inserted.
pub async fn insert_ignoring_duplicates(
    db: &Database,
    group_id: i64,
    pairs: &[(String, String)],
) -> Result<u64> {
    if pairs.is_empty() {
        return Ok(0);
    }

    let now = now_ms();
    let row_template = "(?, ?, ?, 'active', 0, ?, ?)";
    let values = vec![row_template; pairs.len()].join(", ");

    let template = match db.dialect() {
        Dialect::MySql => format!(
            "INSERT IGNORE INTO api_keys \
             (group_id, key_value, key_hash, status, failure_count, created_at, updated_at) \
             VALUES {values}"
        ),
        Dialect::Postgres | Dialect::Sqlite => format!(
            "INSERT INTO api_keys \
             (group_id, key_value, key_hash, status, failure_count, created_at, updated_at) \
             VALUES {values} ON CONFLICT (group_id, key_hash) DO NOTHING"
        ),
    };

    let sql = db.sql(&template);
    let mut query = sqlx::query(&sql);
    for (value, hash) in pairs {
        query = query
            .bind(group_id)
            .bind(value)
            .bind(hash)
            .bind(now)
            .bind(now);
    }

    Ok(query.execute(db.pool()).await?.rows_affected())
}

/// Delete credentials of a group by digest. Returns the number removed.
pub async fn delete_by_hashes(db: &Database, group_id: i64, hashes: &[String]) -> Result<u64> {
    if hashes.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; hashes.len()].join(", ");
    let template = format!(
        "DELETE FROM api_keys WHERE group_id = ? AND key_hash IN ({placeholders})"
    );

    let sql = db.sql(&template);
    let mut query = sqlx::query(&sql);
    query = query.bind(group_id);
    for hash in hashes {
        query = query.bind(hash);
    }

    Ok(query.execute(db.pool()).await?.rows_affected())
}

pub async fn set_status(db: &Database, id: i64, status: KeyStatus) -> Result<()> {
    sqlx::query(&db.sql("UPDATE api_keys SET status = ?, updated_at = ? WHERE id = ?"))
        .bind(status.as_str())
        .bind(now_ms())
        .bind(id)
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Success feedback: zero the failure counter, stamp last use, and restore
/// active status.
pub async fn mark_success(db: &Database, id: i64) -> Result<()> {
    let now = now_ms();
    sqlx::query(&db.sql(
        "UPDATE api_keys SET failure_count = 0, status = 'active', \
         last_used_at = ?, updated_at = ? WHERE id = ?",
    ))
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn record_failure(db: &Database, id: i64, failure_count: i64) -> Result<()> {
    sqlx::query(&db.sql(
        "UPDATE api_keys SET failure_count = ?, updated_at = ? WHERE id = ?",
    ))
    .bind(failure_count)
    .bind(now_ms())
    .bind(id)
    .execute(db.pool())
    .await?;
    Ok(())
}
