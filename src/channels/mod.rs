//! Per-vendor channel adapters.
//!
//! A channel adapter maps a generic proxied request into a vendor's wire
//! shape: where the credential goes, how streaming is detected, how the
//! model name is extracted, and what a minimal health probe looks like.
//! Implementations are registered by vendor tag and looked up per group.

mod anthropic;
mod gemini;
pub mod header_rules;
mod openai;

pub use anthropic::AnthropicChannel;
pub use gemini::GeminiChannel;
pub use openai::OpenAiChannel;

use crate::domain::Group;
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::body::Body;
use http::request::Parts;
use http_body_util::BodyExt;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::Arc;

/// Pooled upstream HTTP client shared by the proxy engine and the health
/// probes.
pub type HttpClient = hyper_util::client::legacy::Client<HttpsConnector<HttpConnector>, Body>;

pub fn build_http_client() -> HttpClient {
    hyper_util::client::legacy::Client::builder(TokioExecutor::new())
        .build(HttpsConnector::new())
}

/// Vendor-specific request shaping and probing strategy.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Vendor tag this adapter is registered under.
    fn name(&self) -> &'static str;

    /// Place the credential on an outgoing upstream request.
    fn rewrite_request(&self, parts: &mut Parts, api_key: &str, group: &Group) -> Result<()>;

    /// Streaming sniff. Checked in order: vendor path suffix, `Accept:
    /// text/event-stream`, `?stream=true`, JSON body `"stream": true`.
    fn is_stream(&self, parts: &Parts, body: &[u8]) -> bool {
        generic_stream_sniff(parts, body)
    }

    /// Best-effort model extraction from path or JSON body; empty when
    /// neither matches.
    fn extract_model(&self, parts: &Parts, body: &[u8]) -> String {
        let model = model_from_path(parts.uri.path());
        if !model.is_empty() {
            return model;
        }
        model_from_body(body)
    }

    /// Minimal vendor call against the group's test model; `Ok(true)` on
    /// any 2xx. Non-2xx bodies are parsed into a short human message.
    async fn health_probe(&self, client: &HttpClient, api_key: &str, group: &Group)
        -> Result<bool>;
}

/// Registry of channel adapters keyed by vendor tag.
pub struct ChannelRegistry {
    channels: HashMap<&'static str, Arc<dyn ChannelAdapter>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            channels: HashMap::new(),
        };
        registry.register(Arc::new(OpenAiChannel));
        registry.register(Arc::new(GeminiChannel));
        registry.register(Arc::new(AnthropicChannel));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.channels.insert(adapter.name(), adapter);
    }

    pub fn get(&self, channel_type: &str) -> Result<Arc<dyn ChannelAdapter>> {
        self.channels
            .get(channel_type)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown channel type: {channel_type}")))
    }
}

/// Shared streaming sniff for vendors without a dedicated path suffix.
pub(crate) fn generic_stream_sniff(parts: &Parts, body: &[u8]) -> bool {
    if parts
        .headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
    {
        return true;
    }

    if query_param(parts, "stream").is_some_and(|v| v == "true") {
        return true;
    }

    #[derive(serde::Deserialize)]
    struct StreamPayload {
        #[serde(default)]
        stream: bool,
    }
    serde_json::from_slice::<StreamPayload>(body)
        .map(|p| p.stream)
        .unwrap_or(false)
}

pub(crate) fn query_param(parts: &Parts, name: &str) -> Option<String> {
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        if k == name {
            return Some(v.to_string());
        }
    }
    None
}

/// Extract `<name>` from path segments of the shape `.../models/<name>:<op>`.
pub(crate) fn model_from_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "models" {
            if let Some(next) = segments.get(i + 1) {
                return next.split(':').next().unwrap_or("").to_string();
            }
        }
    }
    String::new()
}

/// Extract the `model` field from a JSON body, stripping an optional
/// `models/` prefix.
pub(crate) fn model_from_body(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ModelPayload {
        #[serde(default)]
        model: String,
    }
    serde_json::from_slice::<ModelPayload>(body)
        .map(|p| p.model.trim_start_matches("models/").to_string())
        .unwrap_or_default()
}

/// Reduce an upstream error body to a short human-readable message.
pub fn parse_upstream_error(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorEnvelope {
        error: Option<InnerError>,
        message: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct InnerError {
        message: Option<String>,
    }

    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
        if let Some(message) = envelope.error.and_then(|e| e.message) {
            return message;
        }
        if let Some(message) = envelope.message {
            return message;
        }
    }

    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.len() > 256 {
        format!("{}...", &trimmed[..256])
    } else {
        trimmed.to_string()
    }
}

/// Join a group upstream base URL with a vendor path.
pub(crate) fn join_upstream(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Issue a probe request and fold the response into the health contract.
///
/// `strict_envelope_check` rejects 2xx responses whose body still carries a
/// vendor error envelope; some vendors report quota errors that way.
pub(crate) async fn execute_probe(
    client: &HttpClient,
    request: http::Request<Body>,
    strict_envelope_check: bool,
) -> Result<bool> {
    let response = client
        .request(request)
        .await
        .map_err(|e| Error::RetryableUpstream(format!("probe request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        if !strict_envelope_check {
            return Ok(true);
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        return Ok(!has_error_envelope(&body));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    Err(Error::FatalAuth(format!(
        "[status {}] {}",
        status.as_u16(),
        parse_upstream_error(&body)
    )))
}

/// Whether a response body parses as a vendor error envelope.
pub(crate) fn has_error_envelope(body: &[u8]) -> bool {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: Option<serde_json::Value>,
    }
    serde_json::from_slice::<Envelope>(body)
        .map(|e| e.error.is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts_for(uri: &str, accept: Option<&str>) -> Parts {
        let mut builder = http::Request::builder().uri(uri);
        if let Some(accept) = accept {
            builder = builder.header(http::header::ACCEPT, accept);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_registry_knows_all_vendors() {
        let registry = ChannelRegistry::new();
        for vendor in ["openai", "gemini", "anthropic"] {
            assert!(registry.get(vendor).is_ok(), "missing {vendor}");
        }
        assert!(registry.get("unknown").is_err());
    }

    #[test]
    fn test_stream_sniff_order() {
        // Accept header wins without a body.
        let parts = parts_for("/v1/chat/completions", Some("text/event-stream"));
        assert!(generic_stream_sniff(&parts, b""));

        // Query parameter.
        let parts = parts_for("/v1/chat/completions?stream=true", None);
        assert!(generic_stream_sniff(&parts, b"{}"));

        // JSON body flag.
        let parts = parts_for("/v1/chat/completions", None);
        assert!(generic_stream_sniff(&parts, br#"{"stream": true}"#));
        assert!(!generic_stream_sniff(&parts, br#"{"stream": false}"#));
        assert!(!generic_stream_sniff(&parts, b"not json"));
    }

    #[test]
    fn test_model_from_path() {
        assert_eq!(
            model_from_path("/v1beta/models/gemini-2.0-flash:generateContent"),
            "gemini-2.0-flash"
        );
        assert_eq!(model_from_path("/v1/chat/completions"), "");
    }

    #[test]
    fn test_model_from_body_strips_prefix() {
        assert_eq!(model_from_body(br#"{"model": "models/gemini-pro"}"#), "gemini-pro");
        assert_eq!(model_from_body(br#"{"model": "gpt-4o"}"#), "gpt-4o");
        assert_eq!(model_from_body(b"{}"), "");
    }

    #[test]
    fn test_parse_upstream_error_shapes() {
        assert_eq!(
            parse_upstream_error(br#"{"error": {"message": "quota exceeded"}}"#),
            "quota exceeded"
        );
        assert_eq!(
            parse_upstream_error(br#"{"message": "bad key"}"#),
            "bad key"
        );
        assert_eq!(parse_upstream_error(b"plain text failure"), "plain text failure");
    }

    #[test]
    fn test_join_upstream() {
        assert_eq!(
            join_upstream("https://api.example.com/", "/v1/models"),
            "https://api.example.com/v1/models"
        );
    }
}
