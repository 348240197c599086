//! Attachment classification and conversion to prompt text.
//!
//! Each upload is classified by its extension. Recognised files are converted
//! to plain text and appended to the user's message under a per-file label;
//! anything else is skipped. A file that is recognised but cannot be
//! converted fails the whole turn.

use std::path::Path;
use tracing::debug;

use crate::error::RelayError;

/// One uploaded file, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    PlainText,
    Table { delimiter: u8 },
    PortableDocument,
}

impl AttachmentKind {
    pub fn classify(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "md" | "markdown" | "text" | "log" | "json" => Some(Self::PlainText),
            "csv" => Some(Self::Table { delimiter: b',' }),
            "tsv" => Some(Self::Table { delimiter: b'\t' }),
            "pdf" => Some(Self::PortableDocument),
            _ => None,
        }
    }
}

pub fn file_label(filename: &str) -> String {
    format!("--- File: {filename} ---")
}

/// Plain text of one attachment, or `None` if its type is not recognised.
pub fn extract_text(attachment: &Attachment) -> Result<Option<String>, RelayError> {
    let Some(kind) = AttachmentKind::classify(&attachment.filename) else {
        debug!(filename = %attachment.filename, "Skipping unrecognised attachment");
        return Ok(None);
    };

    let failed = |reason: String| RelayError::FileProcessing {
        filename: attachment.filename.clone(),
        reason,
    };

    let text = match kind {
        AttachmentKind::PlainText => plain_text(&attachment.bytes).map_err(failed)?,
        AttachmentKind::Table { delimiter } => {
            table_text(&attachment.bytes, delimiter).map_err(failed)?
        }
        AttachmentKind::PortableDocument => document_text(&attachment.bytes).map_err(failed)?,
    };
    Ok(Some(text))
}

fn plain_text(bytes: &[u8]) -> Result<String, String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| format!("not valid UTF-8: {e}"))
}

fn table_text(bytes: &[u8], delimiter: u8) -> Result<String, String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let separator = if delimiter == b'\t' { "\t" } else { ", " };
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("invalid table: {e}"))?;
        rows.push(record.iter().collect::<Vec<_>>().join(separator));
    }
    Ok(rows.join("\n"))
}

fn document_text(bytes: &[u8]) -> Result<String, String> {
    // The PDF parser panics on some malformed inputs.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text.trim().to_string()),
        Ok(Err(e)) => Err(format!("unreadable PDF: {e}")),
        Err(_) => Err("unreadable PDF".to_string()),
    }
}

/// Labelled sections for every recognised attachment, in upload order.
pub fn render_attachments(attachments: &[Attachment]) -> Result<Vec<String>, RelayError> {
    let mut sections = Vec::new();
    for attachment in attachments {
        if let Some(text) = extract_text(attachment)? {
            sections.push(format!("{}\n{}", file_label(&attachment.filename), text));
        }
    }
    Ok(sections)
}

/// [`render_attachments`] off the async runtime.
pub async fn render_attachments_blocking(
    attachments: Vec<Attachment>,
) -> Result<Vec<String>, RelayError> {
    if attachments.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || render_attachments(&attachments))
        .await
        .map_err(|e| RelayError::Internal(format!("attachment worker failed: {e}")))?
}
