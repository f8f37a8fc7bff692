//! Request-log query and CSV export handlers.

use super::AdminState;
use crate::crypto::{CryptoService, DECRYPT_SENTINEL};
use crate::domain::RequestLog;
use crate::error::Result;
use crate::infrastructure::logs::{self, LogFilters};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Deserialize)]
pub struct LogQuery {
    pub group_name: Option<String>,
    /// Plaintext credential; hashed before it reaches SQL.
    pub key_value: Option<String>,
    pub model: Option<String>,
    pub is_success: Option<bool>,
    pub request_type: Option<String>,
    pub status_code: Option<i64>,
    pub source_ip: Option<String>,
    pub error_contains: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl LogQuery {
    fn filters(&self, state: &AdminState) -> LogFilters {
        LogFilters {
            group_name: self.group_name.clone(),
            key_hash: self
                .key_value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| state.crypto.digest(v)),
            model: self.model.clone(),
            is_success: self.is_success,
            request_type: self.request_type.clone(),
            status_code: self.status_code,
            source_ip: self.source_ip.clone(),
            error_contains: self.error_contains.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

#[derive(Serialize)]
pub struct LogPage {
    pub total: i64,
    pub items: Vec<RequestLog>,
}

pub async fn query(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 500);

    let (items, total) = logs::query_page(
        &state.db,
        &query.filters(&state),
        page_size,
        (page - 1) * page_size,
    )
    .await?;

    Ok(Json(LogPage { total, items }))
}

/// Export the unique credentials observed in the filtered logs as CSV.
/// Values that no longer decrypt are exported as the sentinel, never as an
/// opaque error.
pub async fn export_csv(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<LogQuery>,
) -> Result<Response> {
    let exported = logs::export_unique_keys(&state.db, &query.filters(&state)).await?;

    let mut csv = String::from("key_value,group_name,status_code\n");
    for record in exported {
        let value = match record.key_value {
            Some(stored) => match state.crypto.decrypt(&stored) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("failed to decrypt key {} for export: {e}", record.key_hash);
                    DECRYPT_SENTINEL.to_string()
                }
            },
            // The credential was deleted since it was logged; only its
            // digest remains.
            None => record.key_hash.clone(),
        };

        csv.push_str(&csv_field(&value));
        csv.push(',');
        csv.push_str(&csv_field(&record.group_name));
        csv.push(',');
        csv.push_str(&record.status_code.to_string());
        csv.push('\n');
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"keys.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("with,comma"), "\"with,comma\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
