//! Reference consumer: read a response body to completion.
//!
//! Mirrors what the browser does: decode frames as bytes arrive, append each
//! fragment to the running message, and treat a stream that ends without the
//! terminator (or a failed read) as an incomplete response.

use futures::{Stream, StreamExt};
use std::fmt::Display;

use crate::decoder::EventDecoder;
use crate::event::Event;
use crate::transcript::Transcript;

/// What the user sees when a turn does not complete.
pub const FALLBACK_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The terminator arrived; the full response text.
    Completed(String),
    /// The stream failed or ended early.
    Incomplete { partial: String, reason: String },
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed(_))
    }

    /// Text to display for this turn.
    pub fn display_text(&self) -> &str {
        match self {
            TurnOutcome::Completed(text) => text,
            TurnOutcome::Incomplete { .. } => FALLBACK_MESSAGE,
        }
    }
}

/// Drain `body`, calling `on_fragment` for every fragment in arrival order.
pub async fn consume<S, B, E>(body: S, mut on_fragment: impl FnMut(&str)) -> TurnOutcome
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = EventDecoder::default();
    let mut transcript = Transcript::default();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return incomplete(transcript, e.to_string()),
        };
        decoder.extend(chunk.as_ref());
        loop {
            let event = match decoder.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => return incomplete(transcript, e.to_string()),
            };
            if let Err(e) = transcript.apply(&event) {
                return incomplete(transcript, e.to_string());
            }
            if let Event::Fragment(fragment) = &event {
                on_fragment(&fragment.content);
            }
        }
    }

    if let Err(e) = decoder.finish() {
        return incomplete(transcript, e.to_string());
    }
    if transcript.is_complete() {
        TurnOutcome::Completed(transcript.into_text())
    } else {
        incomplete(transcript, "stream ended without terminator".to_string())
    }
}

fn incomplete(transcript: Transcript, reason: String) -> TurnOutcome {
    TurnOutcome::Incomplete {
        partial: transcript.into_text(),
        reason,
    }
}
