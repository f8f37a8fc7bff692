//! Request-log records and hourly dashboard counters.

use serde::{Deserialize, Serialize};

/// Whether a log row is the request's final attempt or an intermediate
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Final,
    Retry,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Final => "final",
            Self::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "retry" => Self::Retry,
            _ => Self::Final,
        }
    }
}

/// One record per finalised upstream attempt. Carries the credential's
/// digest, never its plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: i64,
    pub group_name: String,
    pub channel_type: String,
    pub model: String,
    pub status_code: i64,
    pub is_success: bool,
    pub duration_ms: i64,
    pub error_message: String,
    pub source_ip: String,
    pub key_hash: String,
    pub request_type: RequestType,
}

/// Success/failure counters per (hour bucket, group).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyStat {
    /// Hour bucket as unix milliseconds, truncated to the hour.
    pub time: i64,
    pub group_id: i64,
    pub success_count: i64,
    pub failure_count: i64,
}

/// Truncate a unix-millisecond timestamp to its hour bucket.
pub fn hour_bucket(ts_ms: i64) -> i64 {
    const HOUR_MS: i64 = 3_600_000;
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_bucket_truncates() {
        let base = 1_700_000_400_000; // exactly on an hour
        assert_eq!(hour_bucket(base), base);
        assert_eq!(hour_bucket(base + 59 * 60_000), base);
        assert_eq!(hour_bucket(base + 3_600_000), base + 3_600_000);
    }

    #[test]
    fn test_request_type_roundtrip() {
        assert_eq!(RequestType::parse("final"), RequestType::Final);
        assert_eq!(RequestType::parse("retry"), RequestType::Retry);
        assert_eq!(RequestType::Retry.as_str(), "retry");
    }
}
