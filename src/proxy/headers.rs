//! Header handling for proxied requests and responses.

use http::{header, HeaderMap, HeaderValue};

/// Hop-by-hop headers are connection-scoped and never mirrored across the
/// proxy (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Copy all end-to-end headers from `source` into `target`.
pub fn copy_end_to_end(source: &HeaderMap, target: &mut HeaderMap) {
    for (name, value) in source {
        if !is_hop_by_hop(name.as_str()) {
            target.append(name.clone(), value.clone());
        }
    }
}

/// Headers forced onto every streaming response; they also disable proxy
/// buffering along the way back to the client.
pub fn apply_streaming_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.remove(header::CONTENT_LENGTH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }

    #[test]
    fn test_copy_strips_hop_by_hop() {
        let mut source = HeaderMap::new();
        source.insert("content-type", HeaderValue::from_static("application/json"));
        source.insert("connection", HeaderValue::from_static("close"));
        source.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let mut target = HeaderMap::new();
        copy_end_to_end(&source, &mut target);

        assert_eq!(target.len(), 1);
        assert!(target.contains_key("content-type"));
    }

    #[test]
    fn test_streaming_headers_forced() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        apply_streaming_headers(&mut headers);

        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
    }
}
