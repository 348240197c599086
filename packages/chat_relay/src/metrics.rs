//! Relay metrics for observability
//!
//! Atomic counters updated on the request path, exposed as JSON.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Stream metrics
    /// Relays currently writing events
    pub active_streams: AtomicU64,
    /// Fragments written to consumers
    pub fragments_relayed: AtomicU64,

    // Turn metrics
    /// Turn requests routed to a variant
    pub turns_received: AtomicU64,
    /// Turns that failed before the first event
    pub turns_rejected: AtomicU64,
    /// Turns answered with the gate refusal
    pub turns_gated: AtomicU64,
    /// Turns that ended with the terminator
    pub turns_completed: AtomicU64,
    /// Turns cut off by a producer failure, timeout or shutdown
    pub turns_aborted: AtomicU64,
    /// Turns abandoned by the consumer
    pub turns_disconnected: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn turn_received(&self) {
        self.turns_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_rejected(&self) {
        self.turns_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_gated(&self) {
        self.turns_gated.fetch_add(1, Ordering::Relaxed);
    }

    // Stream tracking
    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_relayed(&self) {
        self.fragments_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_completed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_aborted(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        self.turns_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_disconnected(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        self.turns_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            streams: StreamMetrics {
                active: self.active_streams.load(Ordering::Relaxed),
                fragments_relayed: self.fragments_relayed.load(Ordering::Relaxed),
            },
            turns: TurnMetrics {
                received: self.turns_received.load(Ordering::Relaxed),
                rejected: self.turns_rejected.load(Ordering::Relaxed),
                gated: self.turns_gated.load(Ordering::Relaxed),
                completed: self.turns_completed.load(Ordering::Relaxed),
                aborted: self.turns_aborted.load(Ordering::Relaxed),
                disconnected: self.turns_disconnected.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub streams: StreamMetrics,
    pub turns: TurnMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub active: u64,
    pub fragments_relayed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub received: u64,
    pub rejected: u64,
    pub gated: u64,
    pub completed: u64,
    pub aborted: u64,
    pub disconnected: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub producer: String,
    pub variants: usize,
    pub active_streams: u64,
    pub uptime_secs: u64,
}
