//! `relay ask`: send one turn to a running relay and stream the answer.

use relay_wire::{TurnOutcome, consume};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("relay server is unavailable at {0}")]
    Unavailable(String),

    #[error("relay returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("failed to read {path}: {source}")]
    Attachment {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable(url.to_string())
        } else {
            Self::Other(err.into())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub url: String,
    pub variant: Option<String>,
    pub session: Option<String>,
    pub files: Vec<PathBuf>,
}

pub fn chat_url(base: &str, variant: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match variant {
        Some(name) => format!("{base}/api/variants/{name}/chat"),
        None => format!("{base}/api/chat"),
    }
}

async fn multipart_form(
    message: &str,
    options: &AskOptions,
) -> Result<reqwest::multipart::Form, ClientError> {
    let mut form = reqwest::multipart::Form::new().text("message", message.to_string());
    if let Some(session) = &options.session {
        form = form.text("sessionId", session.clone());
    }
    for path in &options.files {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ClientError::Attachment {
                path: path.display().to_string(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        form = form.part(
            "files",
            reqwest::multipart::Part::bytes(bytes).file_name(filename),
        );
    }
    Ok(form)
}

/// Send `message` and print fragments to stdout as they arrive.
pub async fn ask_command(message: &str, options: &AskOptions) -> Result<TurnOutcome, ClientError> {
    let url = chat_url(&options.url, options.variant.as_deref());
    let client = reqwest::Client::new();

    let request = if options.files.is_empty() {
        client.post(&url).json(&serde_json::json!({
            "message": message,
            "sessionId": options.session,
        }))
    } else {
        client.post(&url).multipart(multipart_form(message, options).await?)
    };

    let response = request
        .send()
        .await
        .map_err(|e| ClientError::from_reqwest(&url, e))?;

    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        return Err(ClientError::Server {
            status: status.as_u16(),
            message: body["error"].as_str().unwrap_or("unknown error").to_string(),
        });
    }

    let mut stdout = std::io::stdout();
    let outcome = consume(response.bytes_stream(), |fragment| {
        let _ = write!(stdout, "{fragment}");
        let _ = stdout.flush();
    })
    .await;
    println!();
    Ok(outcome)
}
