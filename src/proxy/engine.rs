//! The per-request proxy state machine.
//!
//! Route → authorize → snapshot body → acquire credential → rewrite →
//! dispatch → classify → feedback → retry or surface. Attempts are bounded
//! per group; total elapsed time is bounded by the proxy request deadline.
//! A streaming response commits the attempt with its first byte and is
//! never retried.

use super::classify::{classify_response, Outcome};
use super::headers::copy_end_to_end;
use super::logging::RequestLogger;
use super::response::{buffered_response, streaming_response, LogFinalizer};
use crate::channels::header_rules::{apply_rules, HeaderContext};
use crate::channels::{parse_upstream_error, ChannelAdapter, ChannelRegistry, HttpClient};
use crate::domain::{now_ms, Group, RequestLog, RequestType};
use crate::error::{Error, Result};
use crate::infrastructure::{groups, Database};
use crate::keypool::{FailureKind, KeyProvider, SelectedKey};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use http::request::Parts;
use http::{header, HeaderMap, StatusCode};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::warn;

pub struct ProxyService {
    db: Database,
    provider: Arc<KeyProvider>,
    registry: Arc<ChannelRegistry>,
    client: HttpClient,
    logger: RequestLogger,
    auth_key: String,
    request_deadline: Duration,
}

impl ProxyService {
    pub fn new(
        db: Database,
        provider: Arc<KeyProvider>,
        registry: Arc<ChannelRegistry>,
        client: HttpClient,
        logger: RequestLogger,
        auth_key: String,
        request_deadline: Duration,
    ) -> Self {
        Self {
            db,
            provider,
            registry,
            client,
            logger,
            auth_key,
            request_deadline,
        }
    }

    /// Ingress router: `ANY /proxy/<group>/<vendor-path>`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/proxy/:group/*path", any(proxy_handler))
            .with_state(self)
    }

    async fn handle(
        &self,
        group_name: String,
        vendor_path: String,
        request: axum::extract::Request,
    ) -> Result<axum::response::Response> {
        let group = groups::find_by_name(&self.db, &group_name).await?;

        let (parts, body) = request.into_parts();
        self.authorize(&parts.headers, &group)?;

        // Snapshot the body once so retryable failures can re-dispatch it.
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| Error::validation(format!("failed to read request body: {e}")))?
            .to_bytes();

        let adapter = self.registry.get(&group.channel_type)?;
        let is_stream = adapter.is_stream(&parts, &body_bytes);
        let model = adapter.extract_model(&parts, &body_bytes);
        let client_ip = client_ip(&parts);

        let deadline = Instant::now() + self.request_deadline;
        let max_attempts = group.max_retries.max(1) as usize;
        let mut last_response: Option<(StatusCode, HeaderMap, Bytes)> = None;

        for attempt in 1..=max_attempts {
            let key = match self.provider.take(&group).await {
                Ok(key) => key,
                Err(e) => {
                    // Out of credentials: surface what the upstream last
                    // said, or fail fast with 503.
                    if let Some((status, headers, body)) = last_response {
                        return Ok(buffered_response(status, &headers, body).into_response());
                    }
                    return Err(e);
                }
            };

            let started = Instant::now();
            let out_request =
                self.build_upstream_request(&parts, &body_bytes, &group, &key, &vendor_path, &client_ip)?;

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::DeadlineExceeded(self.request_deadline))?;

            let dispatched = tokio::time::timeout(remaining, self.client.request(out_request)).await;

            let response = match dispatched {
                Err(_) => {
                    self.feed_failure(&group, &key, FailureKind::Retryable).await;
                    let is_final = attempt == max_attempts;
                    self.log_attempt(
                        &group,
                        &key,
                        &model,
                        &client_ip,
                        StatusCode::GATEWAY_TIMEOUT,
                        false,
                        started,
                        "upstream call exceeded the request deadline",
                        is_final,
                    );
                    if is_final {
                        return Err(Error::DeadlineExceeded(self.request_deadline));
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    self.feed_failure(&group, &key, FailureKind::Retryable).await;
                    let is_final = attempt == max_attempts;
                    self.log_attempt(
                        &group,
                        &key,
                        &model,
                        &client_ip,
                        StatusCode::BAD_GATEWAY,
                        false,
                        started,
                        &format!("connection error: {e}"),
                        is_final,
                    );
                    if is_final {
                        return Err(Error::RetryableUpstream(format!("connection error: {e}")));
                    }
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            if status.is_success() {
                if let Err(e) = self.provider.report_success(&group, &key).await {
                    warn!("success feedback failed for key {}: {e}", key.id);
                }

                let log = self.new_log(&group, &key, &model, &client_ip, status, true, 0, "");

                if is_stream {
                    let finalizer =
                        LogFinalizer::new(self.logger.clone(), group.id, log, started);
                    return Ok(streaming_response(response, finalizer).into_response());
                }

                let (rparts, rbody) = response.into_parts();
                let bytes = rbody
                    .collect()
                    .await
                    .map_err(|e| Error::RetryableUpstream(format!("reading upstream body: {e}")))?
                    .to_bytes();

                let mut log = log;
                log.duration_ms = started.elapsed().as_millis() as i64;
                self.logger.record(group.id, log);

                return Ok(buffered_response(status, &rparts.headers, bytes).into_response());
            }

            // Error response: buffer it for classification and possible
            // verbatim surfacing.
            let (rparts, rbody) = response.into_parts();
            let bytes = rbody.collect().await.map(|b| b.to_bytes()).unwrap_or_default();

            let outcome = classify_response(status, &bytes);
            let kind = match outcome {
                Outcome::FatalAuth => FailureKind::FatalAuth,
                Outcome::Retryable => FailureKind::Retryable,
                Outcome::Uncounted | Outcome::Success => FailureKind::Uncounted,
            };
            self.feed_failure(&group, &key, kind).await;

            let will_retry = outcome.is_retryable() && attempt < max_attempts;
            self.log_attempt(
                &group,
                &key,
                &model,
                &client_ip,
                status,
                false,
                started,
                &parse_upstream_error(&bytes),
                !will_retry,
            );

            if will_retry {
                last_response = Some((status, rparts.headers, bytes));
                continue;
            }

            return Ok(buffered_response(status, &rparts.headers, bytes).into_response());
        }

        // The loop always returns; attempts >= 1.
        Err(Error::internal("proxy attempt loop exhausted"))
    }

    /// Constant-time bearer check against the group's proxy secrets, or the
    /// global auth key when the group has none.
    fn authorize(&self, headers: &HeaderMap, group: &Group) -> Result<()> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or_default();

        let group_keys = group.proxy_key_list();
        let allowed: Vec<&str> = if group_keys.is_empty() {
            vec![self.auth_key.as_str()]
        } else {
            group_keys
        };

        let authorized = allowed
            .iter()
            .filter(|secret| !secret.is_empty())
            .any(|secret| bool::from(token.as_bytes().ct_eq(secret.as_bytes())));

        if authorized {
            Ok(())
        } else {
            Err(Error::FatalAuth("invalid proxy credentials".to_string()))
        }
    }

    fn build_upstream_request(
        &self,
        parts: &Parts,
        body: &Bytes,
        group: &Group,
        key: &SelectedKey,
        vendor_path: &str,
        client_ip: &str,
    ) -> Result<http::Request<Body>> {
        let upstream = group
            .pick_upstream(rand::random())
            .ok_or_else(|| Error::validation(format!("group {} has no upstreams", group.name)))?;

        let mut target = format!(
            "{}/{}",
            upstream.url.trim_end_matches('/'),
            vendor_path.trim_start_matches('/')
        );
        if let Some(query) = parts.uri.query() {
            target.push('?');
            target.push_str(query);
        }

        let (mut out_parts, _) = http::Request::builder()
            .method(parts.method.clone())
            .uri(target)
            .body(())
            .map_err(|e| Error::internal(format!("failed to build upstream request: {e}")))?
            .into_parts();

        copy_end_to_end(&parts.headers, &mut out_parts.headers);
        // The client's proxy bearer and host must not leak upstream; the
        // length is recomputed from the snapshotted body.
        out_parts.headers.remove(header::HOST);
        out_parts.headers.remove(header::AUTHORIZATION);
        out_parts.headers.remove(header::CONTENT_LENGTH);

        self.registry
            .get(&group.channel_type)?
            .rewrite_request(&mut out_parts, &key.plaintext, group)?;

        let ctx = HeaderContext {
            client_ip,
            group,
            api_key: &key.plaintext,
        };
        apply_rules(&mut out_parts.headers, &group.header_rules, &ctx);

        Ok(http::Request::from_parts(out_parts, Body::from(body.clone())))
    }

    async fn feed_failure(&self, group: &Group, key: &SelectedKey, kind: FailureKind) {
        if let Err(e) = self.provider.report_failure(group, key, kind).await {
            warn!("failure feedback failed for key {}: {e}", key.id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn new_log(
        &self,
        group: &Group,
        key: &SelectedKey,
        model: &str,
        client_ip: &str,
        status: StatusCode,
        success: bool,
        duration_ms: i64,
        error: &str,
    ) -> RequestLog {
        RequestLog {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: now_ms(),
            group_name: group.name.clone(),
            channel_type: group.channel_type.clone(),
            model: model.to_string(),
            status_code: status.as_u16() as i64,
            is_success: success,
            duration_ms,
            error_message: error.to_string(),
            source_ip: client_ip.to_string(),
            key_hash: key.key_hash.clone(),
            request_type: RequestType::Final,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_attempt(
        &self,
        group: &Group,
        key: &SelectedKey,
        model: &str,
        client_ip: &str,
        status: StatusCode,
        success: bool,
        started: Instant,
        error: &str,
        is_final: bool,
    ) {
        let mut log = self.new_log(
            group,
            key,
            model,
            client_ip,
            status,
            success,
            started.elapsed().as_millis() as i64,
            error,
        );
        log.request_type = if is_final {
            RequestType::Final
        } else {
            RequestType::Retry
        };
        self.logger.record(group.id, log);
    }
}

/// Client address, preferring the first `X-Forwarded-For` entry over the
/// socket peer.
fn client_ip(parts: &Parts) -> String {
    if let Some(forwarded) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn proxy_handler(
    State(service): State<Arc<ProxyService>>,
    Path((group_name, vendor_path)): Path<(String, String)>,
    request: axum::extract::Request,
) -> axum::response::Response {
    match service.handle(group_name, vendor_path, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let (mut parts, _) = http::Request::builder()
            .uri("/proxy/g1/v1/chat/completions")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(client_ip(&parts), "203.0.113.7");

        parts.headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&parts), "unknown");

        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 2], 4000))));
        assert_eq!(client_ip(&parts), "192.168.1.2");
    }
}
