//! Asynchronous bulk key operations: import, delete, validate.

use super::AdminState;
use crate::domain::TaskStatus;
use crate::error::{Error, Result};
use crate::infrastructure::groups;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct KeysPayload {
    pub keys_text: String,
}

pub async fn import(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
    Json(payload): Json<KeysPayload>,
) -> Result<Json<TaskStatus>> {
    let group = groups::find_by_id(&state.db, id).await?;
    let status = state.runner.start_import(group, payload.keys_text).await?;
    Ok(Json(status))
}

pub async fn delete(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
    Json(payload): Json<KeysPayload>,
) -> Result<Json<TaskStatus>> {
    let group = groups::find_by_id(&state.db, id).await?;
    let status = state.runner.start_delete(group, payload.keys_text).await?;
    Ok(Json(status))
}

pub async fn validate(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskStatus>> {
    let group = groups::find_by_id(&state.db, id).await?;
    let status = state.runner.start_validate(group).await?;
    Ok(Json(status))
}

pub async fn task_status(State(state): State<Arc<AdminState>>) -> Result<Json<TaskStatus>> {
    state
        .tasks
        .get()
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found("no task has been started"))
}
