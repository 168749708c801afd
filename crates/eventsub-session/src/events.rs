//! Session lifecycle events.
//!
//! Every phase change and every delivered welcome or disconnect is also
//! published on a broadcast channel, so observers (dashboards, tests, the CLI)
//! can follow a session without registering handlers. Emission never blocks:
//! with no subscribers, or with a lagging one, events are simply lost.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::{DisconnectReason, SessionPhase};

/// Broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened in a session's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The phase changed.
    PhaseChanged {
        /// Old phase
        from: SessionPhase,
        /// New phase
        to: SessionPhase,
        /// Generation of the most recently opened stream
        generation: u64,
    },

    /// A stream is being opened.
    Connecting {
        /// Stream generation
        generation: u64,
        /// Target URL
        url: String,
    },

    /// A session was welcomed.
    Welcomed {
        /// Stream generation
        generation: u64,
        /// New session id
        session_id: String,
        /// Whether it replaced an earlier session
        reconnected: bool,
    },

    /// A connection attempt failed.
    ConnectionFailed {
        /// Stream generation
        generation: u64,
        /// Why
        error: String,
    },

    /// The live connection was lost.
    ConnectionLost {
        /// Stream generation
        generation: u64,
        /// Why
        reason: String,
    },

    /// The session stopped.
    Disconnected {
        /// Why
        reason: DisconnectReason,
    },
}

/// Non-blocking emitter for [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct SessionEventEmitter {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventEmitter {
    /// Creates a new emitter.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// A new receiver seeing every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Emits an event; dropped when nobody listens.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Emits a phase change
    pub fn emit_phase_changed(&self, from: SessionPhase, to: SessionPhase, generation: u64) {
        self.emit(SessionEvent::PhaseChanged {
            from,
            to,
            generation,
        });
    }

    /// Emits a disconnect
    pub fn emit_disconnected(&self, reason: DisconnectReason) {
        self.emit(SessionEvent::Disconnected { reason });
    }
}

impl Default for SessionEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_event_emitter() {
        let emitter = SessionEventEmitter::new();
        let mut receiver = emitter.subscribe();

        emitter.emit_phase_changed(SessionPhase::Idle, SessionPhase::Connecting, 1);
        emitter.emit_disconnected(DisconnectReason::Requested);

        assert_eq!(
            receiver.recv().await.unwrap(),
            SessionEvent::PhaseChanged {
                from: SessionPhase::Idle,
                to: SessionPhase::Connecting,
                generation: 1,
            }
        );
        assert!(matches!(
            receiver.recv().await.unwrap(),
            SessionEvent::Disconnected {
                reason: DisconnectReason::Requested
            }
        ));
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let emitter = SessionEventEmitter::default();
        emitter.emit_disconnected(DisconnectReason::Requested);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SessionEvent::Welcomed {
            generation: 2,
            session_id: "abc".to_string(),
            reconnected: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "welcomed");
        assert_eq!(json["session_id"], "abc");
    }
}
