use thiserror::Error;

/// GPT-Load application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("No keys available for group: {group}")]
    NoKeysAvailable { group: String },

    #[error("Corrupt ciphertext: {0}")]
    CorruptCiphertext(String),

    #[error("Authentication rejected: {0}")]
    FatalAuth(String),

    #[error("Retryable upstream failure: {0}")]
    RetryableUpstream(String),

    #[error("Uncounted upstream failure: {0}")]
    UncountedUpstream(String),

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn no_keys(group: impl Into<String>) -> Self {
        Self::NoKeysAvailable {
            group: group.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error maps to a missing-key lookup rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::NoKeysAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::FatalAuth(_) => StatusCode::UNAUTHORIZED,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::RetryableUpstream(_) => StatusCode::BAD_GATEWAY,
            Error::UncountedUpstream(_) => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Internal detail stays in the logs.
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = axum::Json(serde_json::json!({
            "error": { "message": message }
        }));
        (status, body).into_response()
    }
}
