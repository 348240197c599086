use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use super::{FragmentStream, Prompt, StreamProducer};
use crate::config::ProviderFileConfig;
use crate::error::ProducerError;

/// Streams the last user message back one word at a time.
///
/// Needs no network access or API key, which makes it the producer of
/// choice for local development.
pub struct EchoProducer {
    delay: Duration,
}

impl EchoProducer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_config(config: &ProviderFileConfig) -> Self {
        Self::new(Duration::from_millis(config.echo_delay_ms))
    }
}

#[async_trait]
impl StreamProducer for EchoProducer {
    fn name(&self) -> &str {
        "echo"
    }

    async fn open(&self, prompt: Prompt) -> Result<FragmentStream, ProducerError> {
        let words: Vec<String> = prompt
            .last_user_content()
            .unwrap_or_default()
            .split_inclusive(' ')
            .map(String::from)
            .collect();

        let delay = self.delay;
        Ok(futures::stream::iter(words)
            .then(move |word| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, ProducerError>(word)
            })
            .boxed())
    }
}
