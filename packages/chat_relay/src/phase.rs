//! Per-turn lifecycle.
//!
//! Received → Validated → (Gated | Forwarding) → Streaming → (Completed | Aborted).
//! A gated turn completes without streaming. Failures before streaming end in
//! Rejected. Once streaming, only Completed or Aborted is reachable.

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// Request accepted by the router, body not yet checked
    Received,
    /// Message and attachments passed validation
    Validated,
    /// Refused by the variant's topic gate
    Gated,
    /// Prompt assembled, producer being opened
    Forwarding,
    /// Fragments are being relayed
    Streaming,
    /// Terminator sent
    Completed,
    /// Stream ended without a terminator
    Aborted,
    /// Failed before any event; a JSON error was returned
    Rejected,
}

impl TurnPhase {
    pub fn can_advance_to(self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Validated, Gated)
                | (Validated, Forwarding)
                | (Gated, Completed)
                | (Forwarding, Streaming)
                | (Streaming, Completed)
                | (Streaming, Aborted)
                | (Received | Validated | Forwarding, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnPhase::Completed | TurnPhase::Aborted | TurnPhase::Rejected
        )
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::Received => "received",
            TurnPhase::Validated => "validated",
            TurnPhase::Gated => "gated",
            TurnPhase::Forwarding => "forwarding",
            TurnPhase::Streaming => "streaming",
            TurnPhase::Completed => "completed",
            TurnPhase::Aborted => "aborted",
            TurnPhase::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Tracks one turn through its phases.
#[derive(Debug)]
pub struct TurnLifecycle {
    pub turn_id: Uuid,
    pub variant: String,
    phase: TurnPhase,
}

impl TurnLifecycle {
    pub fn new(variant: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            variant: variant.into(),
            phase: TurnPhase::Received,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: TurnPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            if self.phase.is_terminal() {
                debug!(
                    turn_id = %self.turn_id,
                    "Turn already {}, ignoring {}",
                    self.phase,
                    next
                );
                return false;
            }
            warn!(
                turn_id = %self.turn_id,
                variant = %self.variant,
                "Ignoring illegal turn transition {} -> {}",
                self.phase,
                next
            );
            return false;
        }
        debug!(
            turn_id = %self.turn_id,
            variant = %self.variant,
            "Turn {} -> {}",
            self.phase,
            next
        );
        self.phase = next;
        true
    }
}
