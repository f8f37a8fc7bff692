//! Dashboard read-model: KPI cards, the 24h hourly chart, and the
//! encryption-mismatch self-diagnosis.

use super::AdminState;
use crate::crypto::{CryptoService, PassthroughCrypto};
use crate::domain::log::hour_bucket;
use crate::domain::{now_ms, KeyStatus};
use crate::error::Result;
use crate::infrastructure::{keys, logs};
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Serialize, Default)]
pub struct StatCard {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_value: Option<i64>,
    pub trend: f64,
    pub trend_is_growth: bool,
}

#[derive(Serialize)]
pub struct SecurityWarning {
    pub r#type: String,
    pub message: String,
    pub severity: String,
}

#[derive(Serialize)]
pub struct DashboardStats {
    pub key_count: StatCard,
    pub rpm: StatCard,
    pub request_count: StatCard,
    pub error_rate: StatCard,
    pub security_warnings: Vec<SecurityWarning>,
}

pub async fn stats(State(state): State<Arc<AdminState>>) -> Result<Json<DashboardStats>> {
    let active = keys::count_by_status(&state.db, KeyStatus::Active).await?;
    let invalid = keys::count_by_status(&state.db, KeyStatus::Invalid).await?;

    let now = now_ms();

    // RPM over the last ten minutes, trended against the ten before.
    let ten_minutes = 10 * 60_000;
    let (current_requests, previous_requests) =
        logs::final_request_counts(&state.db, now - ten_minutes, now - 2 * ten_minutes).await?;
    let current_rpm = current_requests as f64 / 10.0;
    let previous_rpm = previous_requests as f64 / 10.0;
    let (rpm_trend, rpm_growth) = trend_pct(current_rpm, previous_rpm);

    // 24h totals trended against the previous 24h.
    let (current_total, current_failures) =
        logs::window_totals(&state.db, now - DAY_MS, now).await?;
    let (previous_total, previous_failures) =
        logs::window_totals(&state.db, now - 2 * DAY_MS, now - DAY_MS).await?;
    let (req_trend, req_growth) = trend_pct(current_total as f64, previous_total as f64);

    let current_error_rate = rate_pct(current_failures, current_total);
    let previous_error_rate = rate_pct(previous_failures, previous_total);
    let error_trend = if previous_total > 0 {
        current_error_rate - previous_error_rate
    } else {
        current_error_rate
    };
    // A falling error rate is the healthy direction.
    let error_growth = if previous_total > 0 {
        error_trend < 0.0
    } else {
        current_error_rate == 0.0
    };

    Ok(Json(DashboardStats {
        key_count: StatCard {
            value: active as f64,
            sub_value: Some(invalid),
            trend: 0.0,
            trend_is_growth: true,
        },
        rpm: StatCard {
            value: current_rpm,
            sub_value: None,
            trend: rpm_trend,
            trend_is_growth: rpm_growth,
        },
        request_count: StatCard {
            value: current_total as f64,
            sub_value: None,
            trend: req_trend,
            trend_is_growth: req_growth,
        },
        error_rate: StatCard {
            value: current_error_rate,
            sub_value: None,
            trend: error_trend,
            trend_is_growth: error_growth,
        },
        security_warnings: security_warnings(&state),
    }))
}

fn trend_pct(current: f64, previous: f64) -> (f64, bool) {
    if previous > 0.0 {
        let trend = (current - previous) / previous * 100.0;
        (trend, trend >= 0.0)
    } else if current > 0.0 {
        (100.0, true)
    } else {
        (0.0, true)
    }
}

fn rate_pct(failures: i64, total: i64) -> f64 {
    if total > 0 {
        failures as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn security_warnings(state: &AdminState) -> Vec<SecurityWarning> {
    let mut warnings = Vec::new();

    if state.auth_key.is_empty() {
        warnings.push(SecurityWarning {
            r#type: "AUTH_KEY".to_string(),
            message: "AUTH_KEY is not set; the admin surface is unprotected".to_string(),
            severity: "high".to_string(),
        });
    } else {
        warnings.extend(check_secret(&state.auth_key, "AUTH_KEY"));
    }

    if !state.encryption_configured {
        warnings.push(SecurityWarning {
            r#type: "ENCRYPTION_KEY".to_string(),
            message: "ENCRYPTION_KEY is not set; credentials are stored in plaintext".to_string(),
            severity: "high".to_string(),
        });
    }

    warnings
}

fn check_secret(secret: &str, kind: &str) -> Vec<SecurityWarning> {
    let mut warnings = Vec::new();

    if secret.len() < 16 {
        warnings.push(SecurityWarning {
            r#type: kind.to_string(),
            message: format!("{kind} is shorter than 16 characters"),
            severity: "high".to_string(),
        });
    }

    let lower = secret.to_lowercase();
    const WEAK: [&str; 6] = ["password", "123456", "admin", "secret", "test", "demo"];
    if WEAK.iter().any(|w| lower.contains(w)) {
        warnings.push(SecurityWarning {
            r#type: kind.to_string(),
            message: format!("{kind} contains a common weak pattern"),
            severity: "high".to_string(),
        });
    }

    warnings
}

#[derive(Deserialize)]
pub struct ChartQuery {
    pub group_id: Option<i64>,
}

#[derive(Serialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub success: Vec<i64>,
    pub failure: Vec<i64>,
}

/// 24 hourly buckets ending at the current hour, zero-filled.
pub async fn chart(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<ChartQuery>,
) -> Result<Json<ChartData>> {
    let end = hour_bucket(now_ms()) + HOUR_MS;
    let start = end - 24 * HOUR_MS;

    let series = logs::hourly_series(&state.db, start, end, query.group_id).await?;

    let mut labels = Vec::with_capacity(24);
    let mut success = vec![0i64; 24];
    let mut failure = vec![0i64; 24];

    for slot in 0..24 {
        let bucket = start + slot as i64 * HOUR_MS;
        let label = chrono::DateTime::from_timestamp_millis(bucket)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        labels.push(label);

        if let Some((_, s, f)) = series.iter().find(|(t, _, _)| *t == bucket) {
            success[slot] = *s;
            failure[slot] = *f;
        }
    }

    Ok(Json(ChartData {
        labels,
        success,
        failure,
    }))
}

#[derive(Serialize)]
pub struct EncryptionStatus {
    pub has_mismatch: bool,
    pub message: String,
    pub suggestion: String,
}

/// Sampled hash-consistency check between the configured encryption state
/// and what the rows actually look like.
pub async fn encryption_status(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<EncryptionStatus>> {
    let sample = keys::sample_with_hash(&state.db, 20).await?;
    if sample.is_empty() {
        return Ok(Json(EncryptionStatus {
            has_mismatch: false,
            message: String::new(),
            suggestion: String::new(),
        }));
    }

    let unkeyed = PassthroughCrypto;
    let plaintext_like = sample
        .iter()
        .filter(|k| unkeyed.digest(&k.key_value) == k.key_hash)
        .count() as f64
        / sample.len() as f64;

    let current_key_matches = sample
        .iter()
        .filter(|k| {
            state
                .crypto
                .decrypt(&k.key_value)
                .map(|plain| state.crypto.digest(&plain) == k.key_hash)
                .unwrap_or(false)
        })
        .count() as f64
        / sample.len() as f64;

    let (has_mismatch, message, suggestion) = if state.encryption_configured
        && plaintext_like > 0.8
    {
        (
            true,
            "ENCRYPTION_KEY is configured but the stored keys are not encrypted; reads will \
             return failed-to-decrypt"
                .to_string(),
            "stop the service and run: gpt-load migrate-keys --to <ENCRYPTION_KEY>".to_string(),
        )
    } else if !state.encryption_configured && plaintext_like < 0.2 {
        (
            true,
            "the stored keys are encrypted but no ENCRYPTION_KEY is configured".to_string(),
            "configure the ENCRYPTION_KEY used at encryption time, or run a decryption migration"
                .to_string(),
        )
    } else if state.encryption_configured && plaintext_like < 0.2 && current_key_matches < 0.2 {
        (
            true,
            "the configured ENCRYPTION_KEY does not match the key the data was encrypted with"
                .to_string(),
            "use the matching ENCRYPTION_KEY, or run: gpt-load migrate-keys --from <old> --to <new>"
                .to_string(),
        )
    } else {
        (false, String::new(), String::new())
    };

    Ok(Json(EncryptionStatus {
        has_mismatch,
        message,
        suggestion,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_pct() {
        let (trend, growth) = trend_pct(150.0, 100.0);
        assert!((trend - 50.0).abs() < f64::EPSILON);
        assert!(growth);

        let (trend, growth) = trend_pct(50.0, 100.0);
        assert!((trend + 50.0).abs() < f64::EPSILON);
        assert!(!growth);

        assert_eq!(trend_pct(10.0, 0.0), (100.0, true));
        assert_eq!(trend_pct(0.0, 0.0), (0.0, true));
    }

    #[test]
    fn test_rate_pct() {
        assert!((rate_pct(1, 4) - 25.0).abs() < f64::EPSILON);
        assert_eq!(rate_pct(0, 0), 0.0);
    }

    #[test]
    fn test_weak_secret_warnings() {
        assert!(check_secret("Str0ng!LongEnough#Key", "AUTH_KEY").is_empty());
        assert!(!check_secret("short", "AUTH_KEY").is_empty());
        assert!(!check_secret("this-contains-password-word", "AUTH_KEY").is_empty());
    }
}
