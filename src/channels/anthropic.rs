//! Anthropic channel: `x-api-key` auth with a pinned API version header.

use super::header_rules::{apply_rules, HeaderContext};
use super::{execute_probe, join_upstream, ChannelAdapter, HttpClient};
use crate::domain::Group;
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::body::Body;
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::HeaderValue;

const API_KEY_HEADER: &str = "x-api-key";
const VERSION_HEADER: &str = "anthropic-version";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicChannel;

#[async_trait]
impl ChannelAdapter for AnthropicChannel {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn rewrite_request(&self, parts: &mut Parts, api_key: &str, _group: &Group) -> Result<()> {
        let value = HeaderValue::from_str(api_key)
            .map_err(|_| Error::validation("credential is not a valid header value"))?;
        parts.headers.insert(API_KEY_HEADER, value);
        if !parts.headers.contains_key(VERSION_HEADER) {
            parts
                .headers
                .insert(VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        }
        Ok(())
    }

    async fn health_probe(
        &self,
        client: &HttpClient,
        api_key: &str,
        group: &Group,
    ) -> Result<bool> {
        let upstream = group
            .upstreams
            .first()
            .ok_or_else(|| Error::validation(format!("group {} has no upstreams", group.name)))?;

        let payload = serde_json::json!({
            "model": group.test_model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}]
        });

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(join_upstream(&upstream.url, "v1/messages"))
            .header(API_KEY_HEADER, api_key)
            .header(VERSION_HEADER, API_VERSION)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&payload)?))
            .map_err(|e| Error::internal(format!("failed to build probe request: {e}")))?;

        if !group.header_rules.is_empty() {
            let ctx = HeaderContext {
                client_ip: "127.0.0.1",
                group,
                api_key,
            };
            apply_rules(request.headers_mut(), &group.header_rules, &ctx);
        }

        execute_probe(client, request, !group.recuperate_on_2xx_envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Upstream;

    fn group() -> Group {
        Group {
            id: 1,
            name: "claude".to_string(),
            display_name: String::new(),
            channel_type: "anthropic".to_string(),
            test_model: "claude-3-5-haiku-latest".to_string(),
            upstreams: vec![Upstream {
                url: "https://api.anthropic.com".to_string(),
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
    fn test_api_key_and_version_headers() {
        let (mut parts, _) = http::Request::builder()
            .uri("https://api.anthropic.com/v1/messages")
            .body(())
            .unwrap()
            .into_parts();

        AnthropicChannel
            .rewrite_request(&mut parts, "sk-ant-test", &group())
            .unwrap();

        assert_eq!(parts.headers.get(API_KEY_HEADER).unwrap(), "sk-ant-test");
        assert_eq!(parts.headers.get(VERSION_HEADER).unwrap(), API_VERSION);
    }

    #[test]
    fn test_caller_pinned_version_is_kept() {
        let (mut parts, _) = http::Request::builder()
            .uri("https://api.anthropic.com/v1/messages")
            .header(VERSION_HEADER, "2024-10-22")
            .body(())
            .unwrap()
            .into_parts();

        AnthropicChannel
            .rewrite_request(&mut parts, "sk-ant-test", &group())
            .unwrap();

        assert_eq!(parts.headers.get(VERSION_HEADER).unwrap(), "2024-10-22");
    }
}
