//! Fragment producers: the upstream side of a turn.

mod echo;
mod openai;

pub use echo::EchoProducer;
pub use openai::OpenAiProducer;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ProviderFileConfig, ProviderKind};
use crate::error::ProducerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a producer needs to generate one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    /// Content of the final user message, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Ordered text deltas. Ends with `None` on success or an `Err` on failure.
pub type FragmentStream = BoxStream<'static, Result<String, ProducerError>>;

#[async_trait]
pub trait StreamProducer: Send + Sync {
    fn name(&self) -> &str;

    /// Start generating. Errors here happen before any event is written.
    async fn open(&self, prompt: Prompt) -> Result<FragmentStream, ProducerError>;
}

/// Construct the configured producer.
pub fn build_producer(config: &ProviderFileConfig) -> anyhow::Result<Arc<dyn StreamProducer>> {
    Ok(match config.kind {
        ProviderKind::Openai => Arc::new(OpenAiProducer::from_config(config)?),
        ProviderKind::Echo => Arc::new(EchoProducer::from_config(config)),
    })
}
