//! OpenAI-compatible chat completions producer.

use anyhow::Context;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use relay_wire::FrameDecoder;
use serde::Deserialize;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use super::{FragmentStream, Prompt, StreamProducer};
use crate::config::ProviderFileConfig;
use crate::error::ProducerError;

/// Upstream marker that ends a completion stream.
const UPSTREAM_DONE: &str = "[DONE]";

/// Longest upstream error body echoed back to the caller.
const MAX_ERROR_MESSAGE_CHARS: usize = 300;

pub struct OpenAiProducer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f64>,
}

impl OpenAiProducer {
    pub fn from_config(config: &ProviderFileConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("failed to build upstream HTTP client")?;

        let api_key = config.resolved_api_key();
        if api_key.is_none() {
            warn!("No API key configured (provider.api_key / OPENAI_API_KEY); upstream may reject requests");
        }

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": prompt.messages,
            "stream": true,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }
}

#[async_trait]
impl StreamProducer for OpenAiProducer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn open(&self, prompt: Prompt) -> Result<FragmentStream, ProducerError> {
        debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            messages = prompt.messages.len(),
            "Opening upstream completion"
        );

        let mut request = self.client.post(&self.endpoint).json(&self.request_body(&prompt));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(ProducerError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProducerError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        Ok(upstream_fragments(response.bytes_stream()))
    }
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<UpstreamErrorBody>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: UpstreamErrorBody,
}

#[derive(Debug, PartialEq, Eq)]
enum UpstreamFrame {
    /// One choice delta; missing content is forwarded as an empty fragment.
    Delta(String),
    /// Frame without choices (usage, keep-alive payloads).
    Empty,
    Done,
}

fn parse_upstream_frame(data: &str) -> Result<UpstreamFrame, ProducerError> {
    let data = data.trim();
    if data == UPSTREAM_DONE {
        return Ok(UpstreamFrame::Done);
    }

    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| ProducerError::Malformed(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(ProducerError::Upstream(
            error.message.unwrap_or_else(|| "unspecified upstream error".to_string()),
        ));
    }

    Ok(match chunk.choices.into_iter().next() {
        Some(choice) => UpstreamFrame::Delta(choice.delta.content.unwrap_or_default()),
        None => UpstreamFrame::Empty,
    })
}

/// Best human-readable message from a non-2xx upstream body.
fn api_error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        if let Some(message) = envelope.error.message {
            return message;
        }
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > MAX_ERROR_MESSAGE_CHARS {
        let cut: String = trimmed.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

struct UpstreamState<S> {
    body: Pin<Box<S>>,
    frames: FrameDecoder,
}

/// Turn an upstream completion body into fragments.
///
/// Frames are parsed one at a time as the stream is polled, so every delta
/// ahead of a failing frame is yielded before the error. The stream ends
/// cleanly only after the upstream `[DONE]` marker; a body that ends without
/// it yields [`ProducerError::UnexpectedEof`].
pub(crate) fn upstream_fragments<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = UpstreamState {
        body: Box::pin(body),
        frames: FrameDecoder::default(),
    };

    futures::stream::try_unfold(state, |mut state| async move {
        loop {
            let frame = state
                .frames
                .next_frame()
                .map_err(|e| ProducerError::Malformed(e.to_string()))?;
            if let Some(frame) = frame {
                match parse_upstream_frame(&frame.data)? {
                    UpstreamFrame::Delta(content) => return Ok(Some((content, state))),
                    UpstreamFrame::Empty => continue,
                    UpstreamFrame::Done => return Ok(None),
                }
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.frames.extend(chunk.as_ref()),
                Some(Err(e)) => return Err(ProducerError::Transport(e.to_string())),
                None => return Err(ProducerError::UnexpectedEof),
            }
        }
    })
    .boxed()
}
