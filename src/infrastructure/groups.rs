//! Group repository.

use super::database::Database;
use crate::domain::{now_ms, Group, HeaderRule, Upstream};
use crate::error::{Error, Result};
use sqlx::any::AnyRow;
use sqlx::Row;

fn group_from_row(row: &AnyRow) -> Result<Group> {
    let upstreams_json: String = row.try_get("upstreams")?;
    let header_rules_json: String = row.try_get("header_rules")?;

    let upstreams: Vec<Upstream> = serde_json::from_str(&upstreams_json)?;
    let header_rules: Vec<HeaderRule> = serde_json::from_str(&header_rules_json)?;

    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        channel_type: row.try_get("channel_type")?,
        test_model: row.try_get("test_model")?,
        upstreams,
        header_rules,
        proxy_keys: row.try_get("proxy_keys")?,
        blacklist_threshold: row.try_get("blacklist_threshold")?,
        max_retries: row.try_get("max_retries")?,
        recuperate_on_2xx_envelope: row.try_get::<i64, _>("recuperate_on_2xx_envelope")? != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const GROUP_COLUMNS: &str = "id, name, display_name, channel_type, test_model, upstreams, \
     header_rules, proxy_keys, blacklist_threshold, max_retries, \
     recuperate_on_2xx_envelope, created_at, updated_at";

pub async fn list(db: &Database) -> Result<Vec<Group>> {
    let rows = sqlx::query(&format!("SELECT {GROUP_COLUMNS} FROM groups ORDER BY id"))
        .fetch_all(db.pool())
        .await?;
    rows.iter().map(group_from_row).collect()
}

pub async fn find_by_name(db: &Database, name: &str) -> Result<Group> {
    let row = sqlx::query(&db.sql(&format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE name = ?"
    )))
    .bind(name)
    .fetch_optional(db.pool())
    .await?
    .ok_or_else(|| Error::not_found(format!("group {name}")))?;
    group_from_row(&row)
}

pub async fn find_by_id(db: &Database, id: i64) -> Result<Group> {
    let row = sqlx::query(&db.sql(&format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?"
    )))
    .bind(id)
    .fetch_optional(db.pool())
    .await?
    .ok_or_else(|| Error::not_found(format!("group id {id}")))?;
    group_from_row(&row)
}

/// Insert a new group and return it with its assigned id.
pub async fn insert(db: &Database, group: &Group) -> Result<Group> {
    let now = now_ms();
    sqlx::query(&db.sql(
        "INSERT INTO groups (name, display_name, channel_type, test_model, upstreams, \
         header_rules, proxy_keys, blacklist_threshold, max_retries, \
         recuperate_on_2xx_envelope, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    ))
    .bind(&group.name)
    .bind(&group.display_name)
    .bind(&group.channel_type)
    .bind(&group.test_model)
    .bind(serde_json::to_string(&group.upstreams)?)
    .bind(serde_json::to_string(&group.header_rules)?)
    .bind(&group.proxy_keys)
    .bind(group.blacklist_threshold)
    .bind(group.max_retries)
    .bind(group.recuperate_on_2xx_envelope as i64)
    .bind(now)
    .bind(now)
    .execute(db.pool())
    .await?;

    find_by_name(db, &group.name).await
}

pub async fn update(db: &Database, group: &Group) -> Result<()> {
    let updated = sqlx::query(&db.sql(
        "UPDATE groups SET display_name = ?, channel_type = ?, test_model = ?, \
         upstreams = ?, header_rules = ?, proxy_keys = ?, blacklist_threshold = ?, \
         max_retries = ?, recuperate_on_2xx_envelope = ?, updated_at = ? WHERE id = ?",
    ))
    .bind(&group.display_name)
    .bind(&group.channel_type)
    .bind(&group.test_model)
    .bind(serde_json::to_string(&group.upstreams)?)
    .bind(serde_json::to_string(&group.header_rules)?)
    .bind(&group.proxy_keys)
    .bind(group.blacklist_threshold)
    .bind(group.max_retries)
    .bind(group.recuperate_on_2xx_envelope as i64)
    .bind(now_ms())
    .bind(group.id)
    .execute(db.pool())
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::not_found(format!("group id {}", group.id)));
    }
    Ok(())
}

/// Delete a group and every credential it owns.
pub async fn delete(db: &Database, id: i64) -> Result<()> {
    sqlx::query(&db.sql("DELETE FROM api_keys WHERE group_id = ?"))
        .bind(id)
        .execute(db.pool())
        .await?;

    let deleted = sqlx::query(&db.sql("DELETE FROM groups WHERE id = ?"))
        .bind(id)
        .execute(db.pool())
        .await?
        .rows_affected();

    if deleted == 0 {
        return Err(Error::not_found(format!("group id {id}")));
    }
    Ok(())
}
