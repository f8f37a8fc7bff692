//! Groups CRUD handlers.

use super::AdminState;
use crate::domain::{Group, GroupName, HeaderRule, Upstream};
use crate::error::{Error, Result};
use crate::infrastructure::groups;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct GroupPayload {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub channel_type: String,
    pub test_model: String,
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    #[serde(default)]
    pub proxy_keys: String,
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_true")]
    pub recuperate_on_2xx_envelope: bool,
}

fn default_blacklist_threshold() -> i64 {
    3
}

fn default_max_retries() -> i64 {
    3
}

fn default_true() -> bool {
    true
}

impl GroupPayload {
    fn validate(&self, state: &AdminState) -> Result<String> {
        let name = GroupName::try_new(self.name.clone())
            .map_err(|e| Error::validation(format!("invalid group name: {e}")))?;

        if self.upstreams.is_empty() {
            return Err(Error::validation("a group needs at least one upstream"));
        }
        for upstream in &self.upstreams {
            if !upstream.url.starts_with("http://") && !upstream.url.starts_with("https://") {
                return Err(Error::validation(format!(
                    "invalid upstream url: {}",
                    upstream.url
                )));
            }
        }

        // Unknown vendors have no adapter to route through.
        state.runner.registry().get(&self.channel_type)?;

        Ok(name.to_string())
    }

    fn into_group(self, id: i64, name: String) -> Group {
        Group {
            id,
            name,
            display_name: self.display_name,
            channel_type: self.channel_type,
            test_model: self.test_model,
            upstreams: self.upstreams,
            header_rules: self.header_rules,
            proxy_keys: self.proxy_keys,
            blacklist_threshold: self.blacklist_threshold,
            max_retries: self.max_retries,
            recuperate_on_2xx_envelope: self.recuperate_on_2xx_envelope,
            created_at: 0,
            updated_at: 0,
        }
    }
}

pub async fn list(State(state): State<Arc<AdminState>>) -> Result<Json<Vec<Group>>> {
    Ok(Json(groups::list(&state.db).await?))
}

pub async fn create(
    State(state): State<Arc<AdminState>>,
    Json(payload): Json<GroupPayload>,
) -> Result<Json<Group>> {
    let name = payload.validate(&state)?;

    if groups::find_by_name(&state.db, &name).await.is_ok() {
        return Err(Error::Conflict(format!("group {name} already exists")));
    }

    let group = groups::insert(&state.db, &payload.into_group(0, name)).await?;
    Ok(Json(group))
}

pub async fn update(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
    Json(payload): Json<GroupPayload>,
) -> Result<Json<Group>> {
    let existing = groups::find_by_id(&state.db, id).await?;
    let name = payload.validate(&state)?;
    if name != existing.name {
        return Err(Error::validation("group names are immutable"));
    }

    groups::update(&state.db, &payload.into_group(id, name)).await?;
    let group = groups::find_by_id(&state.db, id).await?;

    // Threshold or upstream changes affect rotation; rebuild and tell peers.
    state.provider.reload_group(id).await?;
    Ok(Json(group))
}

pub async fn delete(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    groups::find_by_id(&state.db, id).await?;
    groups::delete(&state.db, id).await?;
    state.provider.forget_group(id).await;
    Ok(Json(serde_json::json!({"deleted": true})))
}
