//! OpenAI-compatible channel: bearer auth, `/v1/models` health probe.

use super::header_rules::{apply_rules, HeaderContext};
use super::{execute_probe, join_upstream, ChannelAdapter, HttpClient};
use crate::domain::Group;
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::body::Body;
use http::header::AUTHORIZATION;
use http::request::Parts;
use http::HeaderValue;

pub struct OpenAiChannel;

#[async_trait]
impl ChannelAdapter for OpenAiChannel {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn rewrite_request(&self, parts: &mut Parts, api_key: &str, _group: &Group) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| Error::validation("credential is not a valid header value"))?;
        parts.headers.insert(AUTHORIZATION, value);
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

        let url = join_upstream(&upstream.url, "v1/models");
        let mut request = http::Request::builder()
            .method(http::Method::GET)
            .uri(url)
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .body(Body::empty())
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
            name: "g1".to_string(),
            display_name: String::new(),
            channel_type: "openai".to_string(),
            test_model: "gpt-4o-mini".to_string(),
            upstreams: vec![Upstream {
                url: "https://api.openai.com".to_string(),
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
    fn test_bearer_auth_placement() {
        let (mut parts, _) = http::Request::builder()
            .uri("https://api.openai.com/v1/chat/completions")
            .body(())
            .unwrap()
            .into_parts();

        OpenAiChannel
            .rewrite_request(&mut parts, "sk-test", &group())
            .unwrap();

        assert_eq!(
            parts.headers.get(AUTHORIZATION).unwrap(),
            "Bearer sk-test"
        );
    }

    #[test]
    fn test_model_extraction_from_body() {
        let (parts, _) = http::Request::builder()
            .uri("/v1/chat/completions")
            .body(())
            .unwrap()
            .into_parts();

        let model = OpenAiChannel.extract_model(&parts, br#"{"model": "gpt-4o"}"#);
        assert_eq!(model, "gpt-4o");
    }
}
