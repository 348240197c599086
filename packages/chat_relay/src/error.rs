//! Error types for the relay endpoint and the upstream producers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Failure of the fragment producer, before or during streaming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    #[error("upstream unreachable: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("malformed upstream frame: {0}")]
    Malformed(String),

    #[error("upstream stream ended before completion")]
    UnexpectedEof,

    #[error("turn exceeded the request timeout")]
    Timeout,

    #[error("server is shutting down")]
    Shutdown,
}

impl ProducerError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(_) => "upstream_unreachable",
            Self::Api { .. } => "upstream_rejected",
            Self::Upstream(_) => "upstream_error",
            Self::Malformed(_) => "upstream_malformed",
            Self::UnexpectedEof => "upstream_truncated",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutting_down",
        }
    }
}

/// Everything that can end a turn at the request boundary.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("failed to process {filename}: {reason}")]
    FileProcessing { filename: String, reason: String },

    #[error("unknown variant: {0}")]
    UnknownVariant(String),

    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::FileProcessing { .. } => "file_processing_failed",
            Self::UnknownVariant(_) => "unknown_variant",
            Self::Producer(e) => e.error_code(),
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::FileProcessing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UnknownVariant(_) => StatusCode::NOT_FOUND,
            Self::Producer(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.error_code(), "turn failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "code": self.error_code(),
            })),
        )
            .into_response()
    }
}
