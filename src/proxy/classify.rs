//! Outcome classification for upstream responses.

use http::StatusCode;

/// How a finalised upstream attempt is scored before feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The credential itself was rejected; blacklist immediately.
    FatalAuth,
    /// Worth another attempt with a different credential.
    Retryable,
    /// Recognised noise; surfaced but not charged to the credential.
    Uncounted,
}

impl Outcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable | Self::FatalAuth)
    }
}

/// Upstream payload markers that identify a rejected credential even when
/// the status code alone is ambiguous.
const AUTH_FAILURE_MARKERS: [&str; 6] = [
    "invalid api key",
    "api key not valid",
    "incorrect api key",
    "authentication_error",
    "permission_denied",
    "account has been suspended",
];

/// Markers for errors that must not count against the credential.
const UNCOUNTED_MARKERS: [&str; 2] = [
    "resource has been exhausted",
    "please reduce the length of the messages",
];

/// Only the leading slice of a payload participates in marker matching;
/// error envelopes are small and bodies can be streams of megabytes.
const CLASSIFY_WINDOW: usize = 4096;

pub fn is_uncounted(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lower = message.to_lowercase();
    UNCOUNTED_MARKERS.iter().any(|m| lower.contains(m))
}

fn has_auth_marker(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Classify a finalised upstream response.
pub fn classify_response(status: StatusCode, body: &[u8]) -> Outcome {
    if status.is_success() {
        return Outcome::Success;
    }

    let window = &body[..body.len().min(CLASSIFY_WINDOW)];
    let text = String::from_utf8_lossy(window);

    if is_uncounted(&text) {
        return Outcome::Uncounted;
    }

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || has_auth_marker(&text)
    {
        return Outcome::FatalAuth;
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Outcome::Retryable;
    }

    // Remaining 4xx: the request itself is at fault, not the credential.
    Outcome::Uncounted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        assert_eq!(classify_response(StatusCode::OK, b""), Outcome::Success);
        assert_eq!(classify_response(StatusCode::CREATED, b"{}"), Outcome::Success);
    }

    #[test]
    fn test_auth_failures() {
        assert_eq!(
            classify_response(StatusCode::UNAUTHORIZED, b""),
            Outcome::FatalAuth
        );
        assert_eq!(
            classify_response(StatusCode::FORBIDDEN, b"{}"),
            Outcome::FatalAuth
        );
        // Auth marker in the payload upgrades an otherwise retryable status.
        assert_eq!(
            classify_response(
                StatusCode::BAD_REQUEST,
                br#"{"error": {"message": "Incorrect API key provided"}}"#
            ),
            Outcome::FatalAuth
        );
    }

    #[test]
    fn test_retryable() {
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, b""),
            Outcome::Retryable
        );
        assert_eq!(
            classify_response(StatusCode::BAD_GATEWAY, b""),
            Outcome::Retryable
        );
        assert_eq!(
            classify_response(StatusCode::INTERNAL_SERVER_ERROR, b""),
            Outcome::Retryable
        );
    }

    #[test]
    fn test_uncounted_markers_win() {
        // A 429 carrying a quota-exhausted hint is not charged to the key.
        assert_eq!(
            classify_response(
                StatusCode::TOO_MANY_REQUESTS,
                br#"{"error": {"message": "Resource has been exhausted (e.g. check quota)"}}"#
            ),
            Outcome::Uncounted
        );
        assert!(is_uncounted("Please reduce the length of the messages"));
        assert!(!is_uncounted(""));
    }

    #[test]
    fn test_plain_client_errors_are_uncounted() {
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, b"no such route"),
            Outcome::Uncounted
        );
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, b"malformed"),
            Outcome::Uncounted
        );
    }
}
