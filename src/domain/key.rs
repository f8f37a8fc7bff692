//! Credential rows and their lifecycle status.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Invalid,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "invalid" => Self::Invalid,
            _ => Self::Active,
        }
    }
}

/// An upstream-facing secret belonging to exactly one group. `key_value` is
/// the at-rest (possibly encrypted) representation; the decrypted plaintext
/// only ever lives on the per-request [`crate::keypool::SelectedKey`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub group_id: i64,
    pub key_value: String,
    /// Deterministic digest of the plaintext; unique per group.
    pub key_hash: String,
    pub status: KeyStatus,
    pub failure_count: i64,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        assert_eq!(KeyStatus::parse("active"), KeyStatus::Active);
        assert_eq!(KeyStatus::parse("invalid"), KeyStatus::Invalid);
        assert_eq!(KeyStatus::parse("garbage"), KeyStatus::Active);
        assert_eq!(KeyStatus::Invalid.as_str(), "invalid");
    }
}
