//! Decoding errors for the event stream.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed event payload: {0}")]
    MalformedPayload(String),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("stream ended inside a frame ({pending} bytes pending)")]
    TruncatedFrame { pending: usize },

    #[error("event received after terminator")]
    EventAfterTerminator,
}

impl WireError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::TruncatedFrame { .. } => "truncated_frame",
            Self::EventAfterTerminator => "event_after_terminator",
        }
    }
}
