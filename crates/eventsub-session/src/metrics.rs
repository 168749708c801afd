//! Session metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A serializable snapshot of a session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetricsSnapshot {
    /// Frames read from any stream, stale ones included.
    pub frames_received: u64,

    /// Notifications handed to handlers.
    pub notifications_delivered: u64,

    /// Notifications dropped as redeliveries.
    pub duplicates_dropped: u64,

    /// Frames that could not be classified.
    pub unknown_frames: u64,

    /// Frames and timer expiries dropped because their generation was superseded.
    pub stale_discarded: u64,

    /// Keepalive deadlines that passed without proof of life.
    pub keepalive_timeouts: u64,

    /// Sessions re-established after a migration or a lost connection.
    pub reconnects: u64,

    /// Connection attempts that failed to open or to deliver a welcome.
    pub connection_failures: u64,

    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
}

/// Lock-free counters updated by the driver and read by anyone.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Frames read from any stream (atomic counter).
    pub frames_received: AtomicU64,

    /// Notifications handed to handlers (atomic counter).
    pub notifications_delivered: AtomicU64,

    /// Redeliveries dropped (atomic counter).
    pub duplicates_dropped: AtomicU64,

    /// Unclassifiable frames (atomic counter).
    pub unknown_frames: AtomicU64,

    /// Superseded-generation inputs (atomic counter).
    pub stale_discarded: AtomicU64,

    /// Keepalive expiries (atomic counter).
    pub keepalive_timeouts: AtomicU64,

    /// Re-established sessions (atomic counter).
    pub reconnects: AtomicU64,

    /// Failed connection attempts (atomic counter).
    pub connection_failures: AtomicU64,

    /// Failed handler invocations (atomic counter).
    pub handler_failures: AtomicU64,
}

impl SessionMetrics {
    /// Creates a new `SessionMetrics` instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Creates a serializable snapshot from the current atomic values.
    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            unknown_frames: self.unknown_frames.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            keepalive_timeouts: self.keepalive_timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
