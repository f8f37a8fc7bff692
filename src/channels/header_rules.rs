//! Group header-rule application with variable expansion.

use crate::domain::{Group, HeaderAction, HeaderRule};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Context the rule variables resolve against.
pub struct HeaderContext<'a> {
    pub client_ip: &'a str,
    pub group: &'a Group,
    pub api_key: &'a str,
}

/// Expand the recognised `${...}` variables in a rule value.
pub fn resolve_variables(value: &str, ctx: &HeaderContext<'_>) -> String {
    let now = chrono::Utc::now();
    value
        .replace("${CLIENT_IP}", ctx.client_ip)
        .replace("${TIMESTAMP_MS}", &now.timestamp_millis().to_string())
        .replace("${TIMESTAMP_S}", &now.timestamp().to_string())
        .replace("${GROUP_NAME}", &ctx.group.name)
        .replace("${API_KEY}", ctx.api_key)
}

/// Apply the group's ordered header rules to an outgoing request.
pub fn apply_rules(headers: &mut HeaderMap, rules: &[HeaderRule], ctx: &HeaderContext<'_>) {
    for rule in rules {
        let Ok(name) = HeaderName::from_bytes(rule.key.as_bytes()) else {
            warn!("skipping header rule with invalid name: {}", rule.key);
            continue;
        };

        match rule.action {
            HeaderAction::Remove => {
                headers.remove(&name);
            }
            HeaderAction::Set => {
                let resolved = resolve_variables(&rule.value, ctx);
                match HeaderValue::from_str(&resolved) {
                    Ok(value) => {
                        headers.insert(name, value);
                    }
                    Err(_) => warn!("skipping header rule with invalid value for {}", rule.key),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Upstream;

    fn test_group() -> Group {
        Group {
            id: 7,
            name: "g1".to_string(),
            display_name: String::new(),
            channel_type: "openai".to_string(),
            test_model: "gpt-4o-mini".to_string(),
            upstreams: vec![Upstream {
                url: "https://api.example.com".to_string(),
                weight: 1,
            }],
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
    fn test_variable_expansion() {
        let group = test_group();
        let ctx = HeaderContext {
            client_ip: "10.0.0.9",
            group: &group,
            api_key: "sk-secret",
        };

        assert_eq!(resolve_variables("ip=${CLIENT_IP}", &ctx), "ip=10.0.0.9");
        assert_eq!(resolve_variables("${GROUP_NAME}", &ctx), "g1");
        assert_eq!(resolve_variables("Bearer ${API_KEY}", &ctx), "Bearer sk-secret");

        let ts = resolve_variables("${TIMESTAMP_S}", &ctx);
        assert!(ts.parse::<i64>().unwrap() > 1_600_000_000);
    }

    #[test]
    fn test_rules_apply_in_order() {
        let group = test_group();
        let ctx = HeaderContext {
            client_ip: "127.0.0.1",
            group: &group,
            api_key: "sk-secret",
        };
        let rules = vec![
            HeaderRule {
                key: "x-forwarded-for".to_string(),
                action: HeaderAction::Set,
                value: "${CLIENT_IP}".to_string(),
            },
            HeaderRule {
                key: "x-internal".to_string(),
                action: HeaderAction::Remove,
                value: String::new(),
            },
            // A later rule on the same header wins.
            HeaderRule {
                key: "x-forwarded-for".to_string(),
                action: HeaderAction::Set,
                value: "masked".to_string(),
            },
        ];

        let mut headers = HeaderMap::new();
        headers.insert("x-internal", HeaderValue::from_static("1"));
        apply_rules(&mut headers, &rules, &ctx);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "masked");
        assert!(headers.get("x-internal").is_none());
    }
}
