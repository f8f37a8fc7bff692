//! Upstream-to-client response relay.
//!
//! Non-streaming responses are buffered and mirrored. Streaming responses
//! are pumped through chunk by chunk with a bounded capture buffer; the
//! request log is written when the pump finishes, fails, or the client
//! disconnects mid-stream.

use super::headers::{apply_streaming_headers, copy_end_to_end};
use super::logging::RequestLogger;
use crate::domain::RequestLog;
use axum::body::Body;
use bytes::Bytes;
use futures_util::Stream;
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// Upper bound on captured stream bytes kept for post-stream logging.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// Writes the deferred request log exactly once, whatever way the stream
/// ends.
pub struct LogFinalizer {
    logger: RequestLogger,
    group_id: i64,
    log: RequestLog,
    started: Instant,
}

impl LogFinalizer {
    pub fn new(logger: RequestLogger, group_id: i64, log: RequestLog, started: Instant) -> Self {
        Self {
            logger,
            group_id,
            log,
            started,
        }
    }

    fn complete(mut self, error: Option<String>) {
        self.log.duration_ms = self.started.elapsed().as_millis() as i64;
        if let Some(error) = error {
            self.log.error_message = error;
        }
        self.logger.record(self.group_id, self.log);
    }
}

/// Streaming body pump: forwards upstream chunks to the client while
/// capturing a bounded prefix for logging.
struct CapturedRelay {
    upstream: http_body_util::BodyDataStream<Incoming>,
    captured: Vec<u8>,
    relayed: usize,
    finalizer: Option<LogFinalizer>,
}

impl CapturedRelay {
    fn new(upstream: Incoming, finalizer: LogFinalizer) -> Self {
        Self {
            upstream: upstream.into_data_stream(),
            captured: Vec::new(),
            relayed: 0,
            finalizer: Some(finalizer),
        }
    }

    fn finish(&mut self, error: Option<String>) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };

        // A clean 2xx stream can still end in a vendor error event; surface
        // its message in the log without failing the attempt.
        let error = error.or_else(|| {
            let captured = String::from_utf8_lossy(&self.captured);
            captured
                .rsplit("data:")
                .next()
                .and_then(|tail| serde_json::from_str::<serde_json::Value>(tail.trim()).ok())
                .and_then(|v| {
                    v.get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
        });

        finalizer.complete(error);
    }
}

impl Stream for CapturedRelay {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.relayed += chunk.len();
                let room = CAPTURE_LIMIT.saturating_sub(this.captured.len());
                this.captured
                    .extend_from_slice(&chunk[..chunk.len().min(room)]);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(Some(format!("reading from upstream: {e}")));
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CapturedRelay {
    fn drop(&mut self) {
        // Client went away mid-stream; the attempt is still committed, the
        // log just says how far it got.
        let relayed = self.relayed;
        if self.finalizer.is_some() {
            self.finish(Some(format!("client disconnected after {relayed} bytes")));
        }
    }
}

/// Relay a streaming upstream response, forcing SSE framing.
pub fn streaming_response(
    upstream: http::Response<Incoming>,
    finalizer: LogFinalizer,
) -> http::Response<Body> {
    let (parts, body) = upstream.into_parts();

    let mut headers = HeaderMap::new();
    copy_end_to_end(&parts.headers, &mut headers);
    apply_streaming_headers(&mut headers);

    let mut response = http::Response::new(Body::from_stream(CapturedRelay::new(body, finalizer)));
    *response.status_mut() = parts.status;
    *response.headers_mut() = headers;
    response
}

/// Mirror a buffered upstream response: status, end-to-end headers, body.
pub fn buffered_response(
    status: http::StatusCode,
    upstream_headers: &HeaderMap,
    body: Bytes,
) -> http::Response<Body> {
    let mut headers = HeaderMap::new();
    copy_end_to_end(upstream_headers, &mut headers);
    headers.remove(http::header::CONTENT_LENGTH);

    let mut response = http::Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_response_mirrors_upstream() {
        let mut upstream_headers = HeaderMap::new();
        upstream_headers.insert("content-type", "application/json".parse().unwrap());
        upstream_headers.insert("connection", "close".parse().unwrap());

        let response = buffered_response(
            http::StatusCode::BAD_GATEWAY,
            &upstream_headers,
            Bytes::from_static(b"{\"error\":\"upstream\"}"),
        );

        assert_eq!(response.status(), http::StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert!(response.headers().get("connection").is_none());
    }
}
