//! The turn request: one user submission, read from JSON or multipart.

use axum::{
    Json,
    extract::{FromRef, FromRequest, Multipart, Request},
    http::{StatusCode, header::CONTENT_TYPE},
};
use serde::Deserialize;
use tracing::debug;

use crate::attachments::Attachment;
use crate::config::AttachmentLimits;
use crate::error::RelayError;
use crate::variant::Variant;

const MAX_SESSION_ID_CHARS: usize = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
struct JsonTurn {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "sessionId", alias = "session_id")]
    session_id: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Check the request against the variant that will serve it.
    ///
    /// The message may only be blank when the variant accepts uploads and at
    /// least one was sent.
    pub fn validate(&self, variant: &Variant) -> Result<(), RelayError> {
        if !self.attachments.is_empty() && !variant.accepts_attachments {
            return Err(RelayError::Validation(format!(
                "variant {} does not accept attachments",
                variant.name
            )));
        }
        if self.message.trim().is_empty() && self.attachments.is_empty() {
            return Err(RelayError::Validation(
                "message must not be empty".to_string(),
            ));
        }
        if let Some(session_id) = &self.session_id {
            if session_id.chars().count() > MAX_SESSION_ID_CHARS {
                return Err(RelayError::Validation(format!(
                    "sessionId must be at most {MAX_SESSION_ID_CHARS} characters"
                )));
            }
        }
        Ok(())
    }

    /// The user turn sent upstream: the message followed by attachment sections.
    pub fn user_content(&self, sections: &[String]) -> String {
        let mut content = self.message.trim().to_string();
        for section in sections {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(section);
        }
        content
    }
}

fn normalize_session_id(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn rejection(status: StatusCode, text: String) -> RelayError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        RelayError::PayloadTooLarge(text)
    } else {
        RelayError::Validation(text)
    }
}

async fn read_multipart(
    mut multipart: Multipart,
    limits: AttachmentLimits,
) -> Result<TurnRequest, RelayError> {
    let mut turn = TurnRequest::default();
    let mut session_id = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| rejection(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "message" => {
                turn.message = field
                    .text()
                    .await
                    .map_err(|e| rejection(e.status(), e.body_text()))?;
            }
            "sessionId" | "session_id" => {
                session_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| rejection(e.status(), e.body_text()))?,
                );
            }
            "files" | "files[]" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| rejection(e.status(), e.body_text()))?
                {
                    if bytes.len() + chunk.len() > limits.max_attachment_bytes {
                        return Err(RelayError::PayloadTooLarge(format!(
                            "attachment {} exceeds {} bytes",
                            filename, limits.max_attachment_bytes
                        )));
                    }
                    bytes.extend_from_slice(&chunk);
                }

                // Browsers send an empty part when no file was chosen.
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                if turn.attachments.len() >= limits.max_attachments {
                    return Err(RelayError::PayloadTooLarge(format!(
                        "at most {} attachments are allowed",
                        limits.max_attachments
                    )));
                }
                turn.attachments.push(Attachment { filename, bytes });
            }
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    turn.session_id = normalize_session_id(session_id);
    Ok(turn)
}

impl<S> FromRequest<S> for TurnRequest
where
    S: Send + Sync,
    AttachmentLimits: FromRef<S>,
{
    type Rejection = RelayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let limits = AttachmentLimits::from_ref(state);
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| rejection(e.status(), e.body_text()))?;
            read_multipart(multipart, limits).await
        } else if content_type.starts_with("application/json") {
            let Json(body) = Json::<JsonTurn>::from_request(req, state)
                .await
                .map_err(|e| rejection(e.status(), e.body_text()))?;
            Ok(TurnRequest {
                message: body.message,
                session_id: normalize_session_id(body.session_id),
                attachments: Vec::new(),
            })
        } else {
            Err(RelayError::Validation(format!(
                "unsupported content type: {}",
                if content_type.is_empty() {
                    "(none)"
                } else {
                    content_type.as_str()
                }
            )))
        }
    }
}
