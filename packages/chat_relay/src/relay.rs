//! The forwarding loop: producer fragments → bounded channel → HTTP body.
//!
//! Each turn gets its own task. The task forwards fragments in arrival order,
//! one event per fragment, and finishes in exactly one of three ways:
//!
//! - the producer is exhausted: history is recorded, the terminator is sent;
//! - the producer fails, the deadline passes or the server shuts down: an
//!   error item is sent so the body aborts without a terminator;
//! - the consumer goes away: the producer stream is dropped immediately.

use axum::{
    body::Body,
    http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream::BoxStream};
use relay_wire::Event;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ProducerError, RelayError};
use crate::history::{HistoryStore, SessionKey, Turn};
use crate::metrics::RelayMetrics;
use crate::phase::{TurnLifecycle, TurnPhase};
use crate::producer::FragmentStream;

/// Events for the HTTP body. An `Err` item aborts the response.
pub type EventStream = BoxStream<'static, Result<Event, RelayError>>;

/// Where a completed turn is recorded.
pub struct HistoryRecord {
    pub store: Arc<dyn HistoryStore>,
    pub key: SessionKey,
    pub user: String,
}

pub struct RelayJob {
    /// Must be in the `Forwarding` phase.
    pub lifecycle: TurnLifecycle,
    pub fragments: FragmentStream,
    pub record: Option<HistoryRecord>,
    pub metrics: Arc<RelayMetrics>,
    pub shutdown: CancellationToken,
    pub deadline: Option<Instant>,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { text: String, fragments: usize },
    Aborted(ProducerError),
    Disconnected,
}

enum Stop {
    Exhausted,
    Failed(ProducerError),
    Disconnected,
}

/// Start relaying `job` on its own task.
///
/// The abort travels on its own oneshot and is yielded after the buffered
/// fragments, so it reaches the body even when the consumer is not reading.
pub fn spawn_relay(mut job: RelayJob) -> (EventStream, JoinHandle<RelayOutcome>) {
    let (tx, mut rx) = mpsc::channel(job.channel_capacity.max(1));
    let (abort_tx, abort_rx) = oneshot::channel::<RelayError>();
    job.lifecycle.advance(TurnPhase::Streaming);
    job.metrics.stream_opened();

    let handle = tokio::spawn(run_relay(job, tx, abort_tx));
    let fragments = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    let abort = futures::stream::once(abort_rx)
        .filter_map(|received| futures::future::ready(received.ok().map(Err)));
    (fragments.chain(abort).boxed(), handle)
}

async fn run_relay(
    job: RelayJob,
    tx: mpsc::Sender<Result<Event, RelayError>>,
    abort_tx: oneshot::Sender<RelayError>,
) -> RelayOutcome {
    let RelayJob {
        mut lifecycle,
        mut fragments,
        record,
        metrics,
        shutdown,
        deadline,
        ..
    } = job;

    let mut text = String::new();
    let mut count = 0usize;

    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    let stop = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Stop::Failed(ProducerError::Shutdown),
        _ = expired => Stop::Failed(ProducerError::Timeout),
        _ = tx.closed() => Stop::Disconnected,
        stop = pump(&mut fragments, &tx, &mut text, &mut count, &metrics) => stop,
    };

    // Release the upstream connection before anything else.
    drop(fragments);

    match stop {
        Stop::Exhausted => {
            if let Some(record) = record {
                record
                    .store
                    .append(
                        &record.key,
                        Turn {
                            user: record.user,
                            assistant: text.clone(),
                        },
                    )
                    .await;
            }
            if tx.send(Ok(Event::Terminator)).await.is_err() {
                lifecycle.advance(TurnPhase::Aborted);
                metrics.stream_disconnected();
                info!(
                    turn_id = %lifecycle.turn_id,
                    variant = %lifecycle.variant,
                    fragments = count,
                    "Consumer left before the terminator"
                );
                return RelayOutcome::Disconnected;
            }

            lifecycle.advance(TurnPhase::Completed);
            metrics.stream_completed();
            info!(
                turn_id = %lifecycle.turn_id,
                variant = %lifecycle.variant,
                fragments = count,
                chars = text.chars().count(),
                "Turn completed"
            );
            RelayOutcome::Completed {
                text,
                fragments: count,
            }
        }
        Stop::Failed(error) => {
            lifecycle.advance(TurnPhase::Aborted);
            metrics.stream_aborted();
            warn!(
                turn_id = %lifecycle.turn_id,
                variant = %lifecycle.variant,
                fragments = count,
                code = error.error_code(),
                "Turn aborted: {}",
                error
            );
            let _ = abort_tx.send(RelayError::Producer(error.clone()));
            RelayOutcome::Aborted(error)
        }
        Stop::Disconnected => {
            lifecycle.advance(TurnPhase::Aborted);
            metrics.stream_disconnected();
            info!(
                turn_id = %lifecycle.turn_id,
                variant = %lifecycle.variant,
                fragments = count,
                "Consumer disconnected; upstream released"
            );
            RelayOutcome::Disconnected
        }
    }
}

async fn pump(
    fragments: &mut FragmentStream,
    tx: &mpsc::Sender<Result<Event, RelayError>>,
    text: &mut String,
    count: &mut usize,
    metrics: &RelayMetrics,
) -> Stop {
    while let Some(item) = fragments.next().await {
        let content = match item {
            Ok(content) => content,
            Err(error) => return Stop::Failed(error),
        };
        text.push_str(&content);
        *count += 1;
        for event in Event::fragments(content) {
            if tx.send(Ok(event)).await.is_err() {
                return Stop::Disconnected;
            }
            metrics.fragment_relayed();
        }
    }
    Stop::Exhausted
}

/// The fixed answer for a turn refused by the topic gate.
pub fn gated_events(refusal: &str) -> EventStream {
    let events: Vec<Result<Event, RelayError>> = Event::fragments(refusal)
        .into_iter()
        .chain(std::iter::once(Event::Terminator))
        .map(Ok)
        .collect();
    futures::stream::iter(events).boxed()
}

/// Wrap events in a `text/event-stream` response.
pub fn event_stream_response(events: EventStream) -> Response {
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
        ],
        Body::from_stream(events.map(|item| item.map(|event| event.encode()))),
    )
        .into_response()
}
