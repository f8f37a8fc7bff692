//! Request-log repository and the dashboard read-model queries.

use super::database::{Database, Dialect};
use crate::domain::log::hour_bucket;
use crate::domain::{RequestLog, RequestType};
use crate::error::Result;
use sqlx::any::AnyRow;
use sqlx::Row;

fn log_from_row(row: &AnyRow) -> Result<RequestLog> {
    Ok(RequestLog {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        group_name: row.try_get("group_name")?,
        channel_type: row.try_get("channel_type")?,
        model: row.try_get("model")?,
        status_code: row.try_get("status_code")?,
        is_success: row.try_get::<i64, _>("is_success")? != 0,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        source_ip: row.try_get("source_ip")?,
        key_hash: row.try_get("key_hash")?,
        request_type: RequestType::parse(&row.try_get::<String, _>("request_type")?),
    })
}

pub async fn insert(db: &Database, log: &RequestLog) -> Result<()> {
    sqlx::query(&db.sql(
        "INSERT INTO request_logs \
         (id, timestamp, group_name, channel_type, model, status_code, is_success, \
          duration_ms, error_message, source_ip, key_hash, request_type) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    ))
    .bind(&log.id)
    .bind(log.timestamp)
    .bind(&log.group_name)
    .bind(&log.channel_type)
    .bind(&log.model)
    .bind(log.status_code)
    .bind(log.is_success as i64)
    .bind(log.duration_ms)
    .bind(&log.error_message)
    .bind(&log.source_ip)
    .bind(&log.key_hash)
    .bind(log.request_type.as_str())
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Bump the (hour, group) success/failure counters for one finalised
/// request; atomic upsert per dialect.
pub async fn bump_hourly_stat(
    db: &Database,
    group_id: i64,
    timestamp: i64,
    success: bool,
) -> Result<()> {
    let bucket = hour_bucket(timestamp);
    let (s, f) = if success { (1i64, 0i64) } else { (0i64, 1i64) };

    let template = match db.dialect() {
        Dialect::MySql => {
            "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
             VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
             success_count = success_count + VALUES(success_count), \
             failure_count = failure_count + VALUES(failure_count)"
        }
        Dialect::Postgres | Dialect::Sqlite => {
            "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (time, group_id) DO UPDATE SET \
             success_count = group_hourly_stats.success_count + EXCLUDED.success_count, \
             failure_count = group_hourly_stats.failure_count + EXCLUDED.failure_count"
        }
    };

    sqlx::query(&db.sql(template))
        .bind(bucket)
        .bind(group_id)
        .bind(s)
        .bind(f)
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Admin log-query filters. `key_value` is hashed by the caller before it
/// gets here; plaintext never reaches the SQL layer.
#[derive(Debug, Default, Clone)]
pub struct LogFilters {
    pub group_name: Option<String>,
    pub key_hash: Option<String>,
    pub model: Option<String>,
    pub is_success: Option<bool>,
    pub request_type: Option<String>,
    pub status_code: Option<i64>,
    pub source_ip: Option<String>,
    pub error_contains: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

enum Bind {
    Int(i64),
    Text(String),
}

impl LogFilters {
    /// Build the WHERE clause; `prefix` qualifies column names when the
    /// query joins another table.
    fn where_clause(&self, prefix: &str) -> (String, Vec<Bind>) {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();

        if let Some(v) = &self.group_name {
            conditions.push(format!("{prefix}group_name LIKE ?"));
            binds.push(Bind::Text(format!("%{v}%")));
        }
        if let Some(v) = &self.key_hash {
            conditions.push(format!("{prefix}key_hash = ?"));
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = &self.model {
            conditions.push(format!("{prefix}model LIKE ?"));
            binds.push(Bind::Text(format!("%{v}%")));
        }
        if let Some(v) = self.is_success {
            conditions.push(format!("{prefix}is_success = ?"));
            binds.push(Bind::Int(v as i64));
        }
        if let Some(v) = &self.request_type {
            conditions.push(format!("{prefix}request_type = ?"));
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = self.status_code {
            conditions.push(format!("{prefix}status_code = ?"));
            binds.push(Bind::Int(v));
        }
        if let Some(v) = &self.source_ip {
            conditions.push(format!("{prefix}source_ip = ?"));
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = &self.error_contains {
            conditions.push(format!("{prefix}error_message LIKE ?"));
            binds.push(Bind::Text(format!("%{v}%")));
        }
        if let Some(v) = self.start_time {
            conditions.push(format!("{prefix}timestamp >= ?"));
            binds.push(Bind::Int(v));
        }
        if let Some(v) = self.end_time {
            conditions.push(format!("{prefix}timestamp <= ?"));
            binds.push(Bind::Int(v));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        (clause, binds)
    }
}

fn apply_binds<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    binds: Vec<Bind>,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Int(v) => query.bind(v),
            Bind::Text(v) => query.bind(v),
        };
    }
    query
}

pub async fn query_page(
    db: &Database,
    filters: &LogFilters,
    limit: i64,
    offset: i64,
) -> Result<(Vec<RequestLog>, i64)> {
    let (clause, binds) = filters.where_clause("");

    let count_sql = db.sql(&format!("SELECT COUNT(*) AS n FROM request_logs{clause}"));
    let count_row = apply_binds(sqlx::query(&count_sql), binds)
        .fetch_one(db.pool())
        .await?;
    let total: i64 = count_row.try_get("n")?;

    let (clause, binds) = filters.where_clause("");
    let page_sql = db.sql(&format!(
        "SELECT * FROM request_logs{clause} ORDER BY timestamp DESC LIMIT ? OFFSET ?"
    ));
    let mut query = apply_binds(sqlx::query(&page_sql), binds);
    query = query.bind(limit).bind(offset);

    let rows = query.fetch_all(db.pool()).await?;
    let logs = rows.iter().map(log_from_row).collect::<Result<Vec<_>>>()?;
    Ok((logs, total))
}

/// One exported credential observed in the logs: latest row per digest,
/// joined back to `api_keys` to recover the at-rest value when it still
/// exists.
#[derive(Debug)]
pub struct ExportedKey {
    pub key_hash: String,
    pub key_value: Option<String>,
    pub group_name: String,
    pub status_code: i64,
}

pub async fn export_unique_keys(db: &Database, filters: &LogFilters) -> Result<Vec<ExportedKey>> {
    let (clause, binds) = filters.where_clause("l.");
    let clause = if clause.is_empty() {
        " WHERE l.key_hash != ''".to_string()
    } else {
        format!("{clause} AND l.key_hash != ''")
    };

    // Window function keeps one row per digest even when the same key was
    // re-encrypted between requests.
    let sql = db.sql(&format!(
        "SELECT key_hash, key_value, group_name, status_code FROM ( \
             SELECT l.key_hash AS key_hash, k.key_value AS key_value, \
                    l.group_name AS group_name, l.status_code AS status_code, \
                    ROW_NUMBER() OVER (PARTITION BY l.key_hash ORDER BY l.timestamp DESC) AS rn \
             FROM request_logs l \
             LEFT JOIN api_keys k ON k.key_hash = l.key_hash{clause} \
         ) ranked WHERE rn = 1 ORDER BY key_hash"
    ));

    let rows = apply_binds(sqlx::query(&sql), binds)
        .fetch_all(db.pool())
        .await?;

    rows.iter()
        .map(|row| {
            Ok(ExportedKey {
                key_hash: row.try_get("key_hash")?,
                key_value: row.try_get("key_value")?,
                group_name: row.try_get("group_name")?,
                status_code: row.try_get("status_code")?,
            })
        })
        .collect()
}

/// Total and failed request counts over a time window, from the hourly
/// rollups. Summed in process: SUM() result types are not portable across
/// the three dialects, and the window holds at most 24 rows per group.
pub async fn window_totals(db: &Database, start: i64, end: i64) -> Result<(i64, i64)> {
    let rows = hourly_series(db, start, end, None).await?;
    let total = rows.iter().map(|(_, s, f)| s + f).sum();
    let failures = rows.iter().map(|(_, _, f)| f).sum();
    Ok((total, failures))
}

/// Final-request counts in two adjacent windows, for RPM trend.
pub async fn final_request_counts(
    db: &Database,
    current_start: i64,
    previous_start: i64,
) -> Result<(i64, i64)> {
    let row = sqlx::query(&db.sql(
        "SELECT COUNT(CASE WHEN timestamp >= ? THEN 1 END) AS current_n, \
                COUNT(CASE WHEN timestamp >= ? AND timestamp < ? THEN 1 END) AS previous_n \
         FROM request_logs WHERE timestamp >= ? AND request_type = 'final'",
    ))
    .bind(current_start)
    .bind(previous_start)
    .bind(current_start)
    .bind(previous_start)
    .fetch_one(db.pool())
    .await?;
    Ok((row.try_get("current_n")?, row.try_get("previous_n")?))
}

/// Hourly (time, success, failure) rows, optionally scoped to one group;
/// buckets are merged in process (see [`window_totals`] on SUM portability).
pub async fn hourly_series(
    db: &Database,
    start: i64,
    end: i64,
    group_id: Option<i64>,
) -> Result<Vec<(i64, i64, i64)>> {
    let rows = if let Some(group_id) = group_id {
        sqlx::query(&db.sql(
            "SELECT time, success_count, failure_count FROM group_hourly_stats \
             WHERE time >= ? AND time < ? AND group_id = ? ORDER BY time",
        ))
        .bind(start)
        .bind(end)
        .bind(group_id)
        .fetch_all(db.pool())
        .await?
    } else {
        sqlx::query(&db.sql(
            "SELECT time, success_count, failure_count FROM group_hourly_stats \
             WHERE time >= ? AND time < ? ORDER BY time",
        ))
        .bind(start)
        .bind(end)
        .fetch_all(db.pool())
        .await?
    };

    let mut buckets: std::collections::BTreeMap<i64, (i64, i64)> = std::collections::BTreeMap::new();
    for row in &rows {
        let time: i64 = row.try_get("time")?;
        let s: i64 = row.try_get("success_count")?;
        let f: i64 = row.try_get("failure_count")?;
        let entry = buckets.entry(time).or_default();
        entry.0 += s;
        entry.1 += f;
    }

    Ok(buckets.into_iter().map(|(t, (s, f))| (t, s, f)).collect())
}
