use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::config::{FileConfig, HistoryConfig, HistoryFileConfig, RelayConfig, RelayFileConfig};
use crate::error::ProducerError;
use crate::history::{HistoryStore, InMemoryHistory};
use crate::metrics::RelayMetrics;
use crate::producer::{FragmentStream, Prompt, StreamProducer};
use crate::variant::VariantRegistry;

/// Set once the scripted stream has been dropped.
#[derive(Clone, Default)]
pub struct ReleaseFlag(Arc<AtomicBool>);

impl ReleaseFlag {
    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct ReleaseGuard(ReleaseFlag);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        (self.0).0.store(true, Ordering::SeqCst);
    }
}

/// One scripted producer action.
#[derive(Clone, Debug)]
pub enum Step {
    Fragment(String),
    Fail(ProducerError),
    Delay(Duration),
    /// Never yield again.
    Hang,
}

impl Step {
    pub fn fragment(content: &str) -> Self {
        Step::Fragment(content.to_string())
    }
}

pub fn scripted_stream(steps: Vec<Step>, flag: ReleaseFlag) -> FragmentStream {
    use futures::StreamExt;

    let state = (steps.into_iter(), ReleaseGuard(flag));
    futures::stream::unfold(state, |(mut steps, guard)| async move {
        loop {
            match steps.next()? {
                Step::Fragment(content) => return Some((Ok(content), (steps, guard))),
                Step::Fail(error) => return Some((Err(error), (steps, guard))),
                Step::Delay(delay) => tokio::time::sleep(delay).await,
                Step::Hang => std::future::pending::<()>().await,
            }
        }
    })
    .boxed()
}

/// Producer that replays a fixed script and records every prompt it is given.
pub struct ScriptedProducer {
    steps: Vec<Step>,
    open_error: Option<ProducerError>,
    prompts: Mutex<Vec<Prompt>>,
    flag: ReleaseFlag,
}

impl ScriptedProducer {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            open_error: None,
            prompts: Mutex::new(Vec::new()),
            flag: ReleaseFlag::default(),
        }
    }

    pub fn fragments(fragments: &[&str]) -> Self {
        Self::new(fragments.iter().map(|f| Step::fragment(f)).collect())
    }

    pub fn failing_open(error: ProducerError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::new(Vec::new())
        }
    }

    pub fn opens(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn release_flag(&self) -> ReleaseFlag {
        self.flag.clone()
    }
}

#[async_trait]
impl StreamProducer for ScriptedProducer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, prompt: Prompt) -> Result<FragmentStream, ProducerError> {
        self.prompts.lock().unwrap().push(prompt);
        if let Some(error) = &self.open_error {
            return Err(error.clone());
        }
        Ok(scripted_stream(self.steps.clone(), self.flag.clone()))
    }
}

/// Build an `AppState` with the built-in variants, in-memory history and
/// the given producer.
pub fn test_state(producer: Arc<ScriptedProducer>) -> AppState {
    test_state_with(producer, RelayFileConfig::default())
}

pub fn test_state_with(producer: Arc<ScriptedProducer>, relay: RelayFileConfig) -> AppState {
    let config = FileConfig::default();
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::from_config(
        &HistoryConfig::from_file(&HistoryFileConfig::default()),
    ));

    AppState {
        variants: Arc::new(VariantRegistry::from_config(&config).expect("variants")),
        producer,
        history: Some(history),
        relay: Arc::new(RelayConfig::from_file(&relay)),
        metrics: Arc::new(RelayMetrics::new()),
        shutdown: CancellationToken::new(),
    }
}
