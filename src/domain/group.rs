//! Group: a named routing target bundling upstreams, vendor, header rules,
//! and credentials.

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Group name newtype; doubles as the first path segment of proxy ingress.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, regex = r"^[a-z0-9][a-z0-9_-]*$"),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct GroupName(String);

/// One upstream base URL with a selection weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Header rewrite action applied after the channel adapter runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    Set,
    Remove,
}

/// One ordered header rewrite rule. `value` may reference the variables
/// `${CLIENT_IP}`, `${TIMESTAMP_MS}`, `${TIMESTAMP_S}`, `${GROUP_NAME}`,
/// and `${API_KEY}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderRule {
    pub key: String,
    pub action: HeaderAction,
    #[serde(default)]
    pub value: String,
}

/// A logical endpoint owning a pool of upstream credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    /// Vendor tag selecting the channel adapter: "openai", "gemini",
    /// "anthropic".
    pub channel_type: String,
    /// Model used by credential health probes.
    pub test_model: String,
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    /// Comma-separated proxy-side bearer secrets; empty falls back to the
    /// global auth key.
    #[serde(default)]
    pub proxy_keys: String,
    /// Consecutive-failure count at which a credential is cooled down.
    pub blacklist_threshold: i64,
    /// Upper bound on per-request dispatch attempts.
    pub max_retries: i64,
    /// Promote cooled-down credentials on any 2xx probe response, even when
    /// the body carries a vendor error envelope.
    #[serde(default = "default_recuperate_on_envelope")]
    pub recuperate_on_2xx_envelope: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_recuperate_on_envelope() -> bool {
    true
}

impl Group {
    /// Split the configured proxy secrets; whitespace-tolerant.
    pub fn proxy_key_list(&self) -> Vec<&str> {
        self.proxy_keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Pick an upstream by weight using the caller-supplied roll in
    /// `[0, total_weight)`. Groups always carry at least one upstream.
    pub fn pick_upstream(&self, roll: u32) -> Option<&Upstream> {
        let total: u32 = self.upstreams.iter().map(|u| u.weight.max(1)).sum();
        if total == 0 {
            return self.upstreams.first();
        }
        let mut remaining = roll % total;
        for upstream in &self.upstreams {
            let weight = upstream.weight.max(1);
            if remaining < weight {
                return Some(upstream);
            }
            remaining -= weight;
        }
        self.upstreams.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with_upstreams(upstreams: Vec<Upstream>) -> Group {
        Group {
            id: 1,
            name: "g1".to_string(),
            display_name: String::new(),
            channel_type: "openai".to_string(),
            test_model: "gpt-4o-mini".to_string(),
            upstreams,
            header_rules: Vec::new(),
            proxy_keys: String::new(),
            blacklist_threshold: 3,
            max_retries: 3,
            recuperate_on_2xx_envelope: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_group_name_sanitizes_and_validates() {
        let name = GroupName::try_new("  My-Group  ".to_string()).unwrap();
        assert_eq!(name.as_ref(), "my-group");

        assert!(GroupName::try_new("".to_string()).is_err());
        assert!(GroupName::try_new("has spaces".to_string()).is_err());
    }

    #[test]
    fn test_proxy_key_list_is_whitespace_tolerant() {
        let mut group = group_with_upstreams(vec![]);
        group.proxy_keys = " alpha , ,beta".to_string();
        assert_eq!(group.proxy_key_list(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_pick_upstream_respects_weights() {
        let group = group_with_upstreams(vec![
            Upstream {
                url: "https://a.example".to_string(),
                weight: 1,
            },
            Upstream {
                url: "https://b.example".to_string(),
                weight: 3,
            },
        ]);

        let mut hits = [0u32; 2];
        for roll in 0..4 {
            let upstream = group.pick_upstream(roll).unwrap();
            if upstream.url.contains("a.example") {
                hits[0] += 1;
            } else {
                hits[1] += 1;
            }
        }
        assert_eq!(hits, [1, 3]);
    }
}
