//! Google Gemini channel: query-parameter auth (bearer on the OpenAI-compat
//! surface), `:streamGenerateContent` stream sniff, `generateContent` probe.

use super::header_rules::{apply_rules, HeaderContext};
use super::{
    execute_probe, generic_stream_sniff, join_upstream, model_from_body, model_from_path,
    ChannelAdapter, HttpClient,
};
use crate::domain::Group;
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::body::Body;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::request::Parts;
use http::HeaderValue;
use url::Url;

/// Path marker for Gemini's OpenAI-compatible surface, which takes bearer
/// auth instead of the `key` query parameter.
const OPENAI_COMPAT_MARKER: &str = "v1beta/openai";

pub struct GeminiChannel;

#[async_trait]
impl ChannelAdapter for GeminiChannel {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn rewrite_request(&self, parts: &mut Parts, api_key: &str, _group: &Group) -> Result<()> {
        if parts.uri.path().contains(OPENAI_COMPAT_MARKER) {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| Error::validation("credential is not a valid header value"))?;
            parts.headers.insert(AUTHORIZATION, value);
            return Ok(());
        }

        let mut url = Url::parse(&parts.uri.to_string())
            .map_err(|e| Error::internal(format!("unparseable upstream url: {e}")))?;
        url.query_pairs_mut().append_pair("key", api_key);
        parts.uri = url
            .as_str()
            .parse()
            .map_err(|e| Error::internal(format!("rebuilt upstream url is invalid: {e}")))?;
        Ok(())
    }

    fn is_stream(&self, parts: &Parts, body: &[u8]) -> bool {
        if parts.uri.path().ends_with(":streamGenerateContent") {
            return true;
        }
        generic_stream_sniff(parts, body)
    }

    fn extract_model(&self, parts: &Parts, body: &[u8]) -> String {
        // Native format carries the model in the path; the OpenAI-compat
        // surface carries it in the body.
        let model = model_from_path(parts.uri.path());
        if !model.is_empty() {
            return model;
        }
        model_from_body(body)
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

        let path = format!("v1beta/models/{}:generateContent", group.test_model);
        let mut url = Url::parse(&join_upstream(&upstream.url, &path))
            .map_err(|e| Error::internal(format!("unparseable upstream url: {e}")))?;
        url.query_pairs_mut().append_pair("key", api_key);

        let payload = serde_json::json!({
            "contents": [{"parts": [{"text": "hi"}]}]
        });

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(url.as_str())
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
            name: "gem".to_string(),
            display_name: String::new(),
            channel_type: "gemini".to_string(),
            test_model: "gemini-2.0-flash".to_string(),
            upstreams: vec![Upstream {
                url: "https://generativelanguage.googleapis.com".to_string(),
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

    fn parts_for(uri: &str) -> Parts {
        http::Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_native_auth_goes_into_query() {
        let mut parts = parts_for(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent",
        );
        GeminiChannel
            .rewrite_request(&mut parts, "AIza-test", &group())
            .unwrap();

        assert!(parts.uri.query().unwrap().contains("key=AIza-test"));
        assert!(parts.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_openai_compat_uses_bearer() {
        let mut parts = parts_for(
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
        );
        GeminiChannel
            .rewrite_request(&mut parts, "AIza-test", &group())
            .unwrap();

        assert_eq!(
            parts.headers.get(AUTHORIZATION).unwrap(),
            "Bearer AIza-test"
        );
        assert!(parts.uri.query().is_none());
    }

    #[test]
    fn test_stream_suffix_detection() {
        let parts = parts_for("/v1beta/models/gemini-2.0-flash:streamGenerateContent");
        assert!(GeminiChannel.is_stream(&parts, b"{}"));

        let parts = parts_for("/v1beta/models/gemini-2.0-flash:generateContent");
        assert!(!GeminiChannel.is_stream(&parts, b"{}"));
    }

    #[test]
    fn test_model_from_path_beats_body() {
        let parts = parts_for("/v1beta/models/gemini-2.0-flash:generateContent");
        let model = GeminiChannel.extract_model(&parts, br#"{"model": "other"}"#);
        assert_eq!(model, "gemini-2.0-flash");

        let parts = parts_for("/v1beta/openai/chat/completions");
        let model = GeminiChannel.extract_model(&parts, br#"{"model": "models/gemini-pro"}"#);
        assert_eq!(model, "gemini-pro");
    }
}
