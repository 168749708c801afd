//! Session state machine.
//!
//! [`SessionMachine`] is the pure half of the client: it consumes [`Input`]s
//! (classified frames tagged with their connection generation, timer expiries,
//! stream lifecycle notices, and user commands) and answers with [`Effect`]s for
//! the driver to execute. It never performs I/O, never sleeps and never logs.
//!
//! # Generations
//!
//! Every physical stream gets a fresh generation number. At most two streams
//! are tracked at once: the *active* stream whose welcome was accepted, and a
//! *pending* stream that is being opened (first connect, recovery, or a
//! server-directed migration). Frames from any other generation are stale and
//! are discarded.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventsub_transport::validate_stream_url;
use serde::Serialize;

use crate::classifier::{ClassifiedEvent, UnknownReason};
use crate::config::SessionConfig;
use crate::envelope::Envelope;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Never connected
    Idle,
    /// Opening the first stream, waiting for its welcome
    Connecting,
    /// Welcome accepted; immediately followed by `Live`
    Welcomed,
    /// Receiving on an established session
    Live,
    /// Opening a replacement stream (migration or recovery)
    Reconnecting,
    /// Stopped; only an explicit connect leaves this phase
    Closed,
}

impl SessionPhase {
    /// Whether the session is stopped (never started or closed)
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Idle | Self::Closed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Welcomed => "welcomed",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    /// Current session id; `Some` whenever `is_connected`
    pub session_id: Option<String>,
    /// Whether a welcomed stream is currently live
    pub is_connected: bool,
    /// Last proof of life; never moves backwards
    pub last_keepalive_time: DateTime<Utc>,
    /// Keepalive interval advertised by the current session
    pub keepalive_timeout_seconds: Option<u64>,
    /// Generation of the most recently opened stream
    pub connection_generation: u64,
    /// Lifecycle phase
    pub phase: SessionPhase,
    /// Failed connection attempts since the last welcome
    pub consecutive_failures: u32,
}

impl SessionState {
    /// Fresh state for a client created at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            session_id: None,
            is_connected: false,
            last_keepalive_time: now,
            keepalive_timeout_seconds: None,
            connection_generation: 0,
            phase: SessionPhase::Idle,
            consecutive_failures: 0,
        }
    }
}

/// Why the session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The caller asked for it
    Requested,
    /// The connection was lost and automatic recovery is disabled
    ConnectionLost {
        /// What ended the connection
        error: String,
    },
    /// Connection attempts kept failing
    RetriesExhausted {
        /// Consecutive failed attempts
        attempts: u32,
        /// The last failure
        last_error: String,
    },
}

impl DisconnectReason {
    /// Whether the caller initiated the disconnect
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnect requested"),
            Self::ConnectionLost { error } => write!(f, "connection lost: {error}"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} failed attempts: {last_error}"),
        }
    }
}

/// Something that happened to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Caller asked to connect
    Connect,
    /// The stream for `generation` finished opening
    StreamOpened {
        /// Stream generation
        generation: u64,
    },
    /// A classified frame arrived
    Frame {
        /// Generation of the stream it arrived on
        generation: u64,
        /// What it means
        event: ClassifiedEvent,
    },
    /// The keepalive deadline of `generation` passed without proof of life
    KeepaliveExpired {
        /// Stream generation
        generation: u64,
    },
    /// The opened stream never sent its welcome
    WelcomeTimedOut {
        /// Stream generation
        generation: u64,
    },
    /// The stream ended (remote close or read failure)
    StreamEnded {
        /// Stream generation
        generation: u64,
        /// Why
        reason: String,
    },
    /// The stream could not be opened
    OpenFailed {
        /// Stream generation
        generation: u64,
        /// Why
        reason: String,
        /// Whether trying the same URL again could succeed
        retryable: bool,
    },
    /// Caller asked to disconnect
    Disconnect,
}

/// Work for the driver, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Phase changed
    Transition {
        /// Old phase
        from: SessionPhase,
        /// New phase
        to: SessionPhase,
        /// Generation of the most recently opened stream
        generation: u64,
    },
    /// Open a stream after `delay`
    OpenStream {
        /// Generation to tag its frames with
        generation: u64,
        /// Target URL
        url: String,
        /// Backoff before opening
        delay: Duration,
    },
    /// Close a stream and wait for its reader to stop
    CloseStream {
        /// Stream generation
        generation: u64,
    },
    /// (Re)arm the keepalive watchdog
    ArmKeepalive {
        /// Stream generation
        generation: u64,
        /// Deadline relative to now
        after: Duration,
    },
    /// Arm the welcome deadline for an opened stream
    ArmWelcomeTimeout {
        /// Stream generation
        generation: u64,
        /// Deadline relative to now
        after: Duration,
    },
    /// Invoke welcome handlers
    DeliverWelcome {
        /// Generation of the new session's stream
        generation: u64,
        /// New session id
        session_id: String,
        /// Whether this welcome replaced an earlier session
        reconnected: bool,
    },
    /// Invoke notification handlers
    DeliverNotification {
        /// Generation the notification arrived on
        generation: u64,
        /// The notification
        envelope: Box<Envelope>,
    },
    /// Invoke revocation handlers
    DeliverRevocation {
        /// Revoked subscription
        subscription_id: String,
        /// Revocation status
        status: String,
    },
    /// Invoke disconnect handlers
    DeliverDisconnected {
        /// Why the session stopped
        reason: DisconnectReason,
    },
    /// Input from a superseded generation was dropped
    Discarded {
        /// Its generation
        generation: u64,
        /// What was dropped
        what: &'static str,
    },
    /// An unclassifiable frame was ignored
    Ignored {
        /// Generation it arrived on
        generation: u64,
        /// Why it could not be classified
        reason: UnknownReason,
    },
    /// Something unexpected but recoverable
    Warning {
        /// Description
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Initial,
    Recovery,
    Migration,
}

#[derive(Debug)]
struct PendingStream {
    generation: u64,
    url: String,
    purpose: Purpose,
    opened: bool,
    buffered: VecDeque<Box<Envelope>>,
}

/// The session state machine.
#[derive(Debug)]
pub struct SessionMachine {
    config: SessionConfig,
    state: SessionState,
    active: Option<u64>,
    pending: Option<PendingStream>,
    last_error: Option<String>,
}

impl SessionMachine {
    /// Create an idle machine
    pub fn new(config: SessionConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: SessionState::new(now),
            active: None,
            pending: None,
            last_error: None,
        }
    }

    /// Rebuild a stopped machine from a published state, keeping the
    /// generation counter and liveness clock moving forward.
    pub fn restore(config: SessionConfig, mut state: SessionState) -> Self {
        state.session_id = None;
        state.is_connected = false;
        state.keepalive_timeout_seconds = None;
        state.consecutive_failures = 0;
        if !state.phase.is_stopped() {
            state.phase = SessionPhase::Closed;
        }
        Self {
            config,
            state,
            active: None,
            pending: None,
            last_error: None,
        }
    }

    /// Current state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Generation of the live stream, if any
    pub fn active_generation(&self) -> Option<u64> {
        self.active
    }

    /// Generation of the stream being opened, if any
    pub fn pending_generation(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.generation)
    }

    /// Whether frames of `generation` are still wanted
    pub fn is_current(&self, generation: u64) -> bool {
        self.active == Some(generation) || self.pending_generation() == Some(generation)
    }

    /// Apply one input at time `now`.
    pub fn handle(&mut self, input: Input, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Connect => self.on_connect(&mut effects),
            Input::StreamOpened { generation } => self.on_stream_opened(generation, &mut effects),
            Input::Frame { generation, event } => self.on_frame(generation, event, now, &mut effects),
            Input::KeepaliveExpired { generation } => {
                if self.active == Some(generation) {
                    let after = self.keepalive_deadline();
                    self.connection_lost(
                        generation,
                        format!("no keepalive within {}ms", after.as_millis()),
                        &mut effects,
                    );
                } else {
                    effects.push(Effect::Discarded {
                        generation,
                        what: "keepalive expiry",
                    });
                }
            }
            Input::WelcomeTimedOut { generation } => {
                if self.pending.as_ref().is_some_and(|p| p.generation == generation && p.opened) {
                    effects.push(Effect::CloseStream { generation });
                    let reason = format!(
                        "no welcome within {}ms",
                        self.config.welcome_timeout.as_millis()
                    );
                    self.attempt_failed(reason, true, &mut effects);
                } else {
                    effects.push(Effect::Discarded {
                        generation,
                        what: "welcome timeout",
                    });
                }
            }
            Input::StreamEnded { generation, reason } => {
                if self.active == Some(generation) {
                    self.connection_lost(generation, reason, &mut effects);
                } else if self.pending_generation() == Some(generation) {
                    effects.push(Effect::CloseStream { generation });
                    self.attempt_failed(reason, true, &mut effects);
                } else {
                    effects.push(Effect::Discarded {
                        generation,
                        what: "stream end",
                    });
                }
            }
            Input::OpenFailed {
                generation,
                reason,
                retryable,
            } => {
                if self.pending_generation() == Some(generation) {
                    self.attempt_failed(reason, retryable, &mut effects);
                } else {
                    effects.push(Effect::Discarded {
                        generation,
                        what: "open failure",
                    });
                }
            }
            Input::Disconnect => self.on_disconnect(&mut effects),
        }
        effects
    }

    fn on_connect(&mut self, effects: &mut Vec<Effect>) {
        if !self.state.phase.is_stopped() {
            effects.push(Effect::Warning {
                message: format!("connect ignored, session is {}", self.state.phase),
            });
            return;
        }

        self.state.consecutive_failures = 0;
        self.last_error = None;
        let url = self.config.endpoint.clone();
        self.open(Purpose::Initial, url, Duration::ZERO, effects);
        self.transition(SessionPhase::Connecting, effects);
    }

    fn on_stream_opened(&mut self, generation: u64, effects: &mut Vec<Effect>) {
        match self.pending.as_mut() {
            Some(pending) if pending.generation == generation => {
                pending.opened = true;
                effects.push(Effect::ArmWelcomeTimeout {
                    generation,
                    after: self.config.welcome_timeout,
                });
            }
            _ => effects.push(Effect::Discarded {
                generation,
                what: "stream open",
            }),
        }
    }

    fn on_frame(
        &mut self,
        generation: u64,
        event: ClassifiedEvent,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        if self.active == Some(generation) {
            self.on_active_frame(generation, event, now, effects);
        } else if self.pending_generation() == Some(generation) {
            self.on_pending_frame(generation, event, now, effects);
        } else {
            effects.push(Effect::Discarded {
                generation,
                what: "frame",
            });
        }
    }

    fn on_active_frame(
        &mut self,
        generation: u64,
        event: ClassifiedEvent,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        if let ClassifiedEvent::Unknown { reason } = event {
            effects.push(Effect::Ignored { generation, reason });
            return;
        }

        self.refresh_liveness(now);
        effects.push(Effect::ArmKeepalive {
            generation,
            after: self.keepalive_deadline(),
        });

        match event {
            ClassifiedEvent::SessionWelcome { session_id, .. } => {
                effects.push(Effect::Warning {
                    message: format!(
                        "duplicate welcome (session '{session_id}') on live generation {generation}, treated as keepalive"
                    ),
                });
            }
            ClassifiedEvent::SessionKeepalive | ClassifiedEvent::Unknown { .. } => {}
            ClassifiedEvent::Notification { envelope } => {
                effects.push(Effect::DeliverNotification {
                    generation,
                    envelope,
                });
            }
            ClassifiedEvent::Revocation {
                subscription_id,
                status,
            } => effects.push(Effect::DeliverRevocation {
                subscription_id,
                status,
            }),
            ClassifiedEvent::Reconnect { reconnect_url, .. } => {
                if self.pending.is_some() {
                    effects.push(Effect::Warning {
                        message: "reconnect ignored, a migration is already in progress".to_string(),
                    });
                    return;
                }
                let url = match reconnect_url {
                    Some(url) => match validate_stream_url(&url) {
                        Ok(_) => url,
                        Err(e) => {
                            effects.push(Effect::Warning {
                                message: format!("{e}, migrating to the default endpoint"),
                            });
                            self.config.endpoint.clone()
                        }
                    },
                    None => self.config.endpoint.clone(),
                };
                self.state.consecutive_failures = 0;
                self.open(Purpose::Migration, url, Duration::ZERO, effects);
                self.transition(SessionPhase::Reconnecting, effects);
            }
        }
    }

    fn on_pending_frame(
        &mut self,
        generation: u64,
        event: ClassifiedEvent,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        if event.proves_liveness() {
            self.refresh_liveness(now);
        }

        match event {
            ClassifiedEvent::SessionWelcome {
                session_id,
                keepalive_timeout_seconds,
            } => self.complete_pending(session_id, keepalive_timeout_seconds, now, effects),
            ClassifiedEvent::Notification { envelope } => {
                let capacity = self.config.migration_buffer_capacity;
                if let Some(pending) = self.pending.as_mut() {
                    if pending.buffered.len() < capacity {
                        pending.buffered.push_back(envelope);
                    } else {
                        effects.push(Effect::Warning {
                            message: format!(
                                "notification dropped, {capacity} already buffered before welcome on generation {generation}"
                            ),
                        });
                    }
                }
            }
            ClassifiedEvent::Revocation {
                subscription_id,
                status,
            } => effects.push(Effect::DeliverRevocation {
                subscription_id,
                status,
            }),
            ClassifiedEvent::SessionKeepalive => {}
            ClassifiedEvent::Reconnect { .. } => effects.push(Effect::Warning {
                message: format!("reconnect before welcome on generation {generation} ignored"),
            }),
            ClassifiedEvent::Unknown { reason } => {
                effects.push(Effect::Ignored { generation, reason });
            }
        }
    }

    fn complete_pending(
        &mut self,
        session_id: String,
        keepalive_timeout_seconds: Option<u64>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let generation = pending.generation;

        // The superseded stream goes away before anyone hears about the new session
        let reconnected = self.state.session_id.is_some() || pending.purpose != Purpose::Initial;
        if let Some(old) = self.active.take() {
            effects.push(Effect::CloseStream { generation: old });
        }

        if session_id.is_empty() {
            effects.push(Effect::Warning {
                message: format!("welcome on generation {generation} carried no session id"),
            });
        }

        self.active = Some(generation);
        self.state.session_id = Some(session_id.clone());
        self.state.is_connected = true;
        self.state.keepalive_timeout_seconds = keepalive_timeout_seconds;
        self.state.consecutive_failures = 0;
        self.last_error = None;
        self.refresh_liveness(now);

        self.transition(SessionPhase::Welcomed, effects);
        self.transition(SessionPhase::Live, effects);
        effects.push(Effect::ArmKeepalive {
            generation,
            after: self.keepalive_deadline(),
        });
        effects.push(Effect::DeliverWelcome {
            generation,
            session_id,
            reconnected,
        });
        effects.extend(
            pending
                .buffered
                .into_iter()
                .map(|envelope| Effect::DeliverNotification {
                    generation,
                    envelope,
                }),
        );
    }

    fn connection_lost(&mut self, generation: u64, reason: String, effects: &mut Vec<Effect>) {
        effects.push(Effect::CloseStream { generation });
        self.active = None;
        self.state.is_connected = false;
        self.state.session_id = None;
        self.state.keepalive_timeout_seconds = None;

        if self.pending.as_ref().is_some_and(|p| p.purpose == Purpose::Migration) {
            // The migration target takes over on its own welcome
            effects.push(Effect::Warning {
                message: format!(
                    "generation {generation} lost during migration ({reason}), waiting for the new stream"
                ),
            });
            return;
        }
        if let Some(pending) = self.pending.take() {
            effects.push(Effect::CloseStream {
                generation: pending.generation,
            });
        }

        if !self.config.reconnect.enabled {
            self.stop(DisconnectReason::ConnectionLost { error: reason }, effects);
            return;
        }

        self.last_error = Some(reason);
        self.state.consecutive_failures = 0;
        let url = self.config.endpoint.clone();
        self.open(Purpose::Recovery, url, Duration::ZERO, effects);
        self.transition(SessionPhase::Reconnecting, effects);
    }

    fn attempt_failed(&mut self, reason: String, retryable: bool, effects: &mut Vec<Effect>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        let failures = self.state.consecutive_failures;
        let exhausted = failures >= self.config.reconnect.max_retries;

        if pending.purpose == Purpose::Migration && self.active.is_some() {
            if exhausted {
                effects.push(Effect::Warning {
                    message: format!(
                        "migration abandoned after {failures} failed attempts ({reason}), staying on the current stream"
                    ),
                });
                self.state.consecutive_failures = 0;
                self.transition(SessionPhase::Live, effects);
            } else {
                // A rejected target says nothing about the endpoint, so no backoff
                let delay = if retryable {
                    self.config.reconnect.delay_for_attempt(failures)
                } else {
                    Duration::ZERO
                };
                let url = self.config.endpoint.clone();
                self.last_error = Some(reason);
                self.open(Purpose::Migration, url, delay, effects);
            }
            return;
        }

        if !self.config.reconnect.enabled || !retryable || exhausted {
            self.stop(
                DisconnectReason::RetriesExhausted {
                    attempts: failures,
                    last_error: reason,
                },
                effects,
            );
            return;
        }

        let purpose = match pending.purpose {
            Purpose::Initial => Purpose::Initial,
            Purpose::Recovery | Purpose::Migration => Purpose::Recovery,
        };
        let delay = self.config.reconnect.delay_for_attempt(failures);
        let url = self.config.endpoint.clone();
        self.last_error = Some(reason);
        self.open(purpose, url, delay, effects);
    }

    fn on_disconnect(&mut self, effects: &mut Vec<Effect>) {
        if self.state.phase.is_stopped() {
            self.reset_session();
            return;
        }

        if let Some(pending) = self.pending.take() {
            effects.push(Effect::CloseStream {
                generation: pending.generation,
            });
        }
        if let Some(active) = self.active.take() {
            effects.push(Effect::CloseStream { generation: active });
        }
        self.stop(DisconnectReason::Requested, effects);
    }

    fn stop(&mut self, reason: DisconnectReason, effects: &mut Vec<Effect>) {
        self.reset_session();
        self.transition(SessionPhase::Closed, effects);
        effects.push(Effect::DeliverDisconnected { reason });
    }

    fn reset_session(&mut self) {
        self.active = None;
        self.pending = None;
        self.state.session_id = None;
        self.state.is_connected = false;
        self.state.keepalive_timeout_seconds = None;
    }

    fn open(&mut self, purpose: Purpose, url: String, delay: Duration, effects: &mut Vec<Effect>) {
        self.state.connection_generation += 1;
        let generation = self.state.connection_generation;
        self.pending = Some(PendingStream {
            generation,
            url: url.clone(),
            purpose,
            opened: false,
            buffered: VecDeque::new(),
        });
        effects.push(Effect::OpenStream {
            generation,
            url,
            delay,
        });
    }

    fn transition(&mut self, to: SessionPhase, effects: &mut Vec<Effect>) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        self.state.phase = to;
        effects.push(Effect::Transition {
            from,
            to,
            generation: self.state.connection_generation,
        });
    }

    fn refresh_liveness(&mut self, now: DateTime<Utc>) {
        if now > self.state.last_keepalive_time {
            self.state.last_keepalive_time = now;
        }
    }

    fn keepalive_deadline(&self) -> Duration {
        self.config
            .keepalive_deadline(self.state.keepalive_timeout_seconds)
    }

    /// URL of the stream being opened, if any
    pub fn pending_url(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.url.as_str())
    }

    /// Last connection failure since the last welcome
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify_str;
    use crate::config::{DEFAULT_ENDPOINT, ReconnectConfig};
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn welcome(id: &str, keepalive: u64) -> ClassifiedEvent {
        ClassifiedEvent::SessionWelcome {
            session_id: id.to_string(),
            keepalive_timeout_seconds: Some(keepalive),
        }
    }

    fn notification(id: &str) -> ClassifiedEvent {
        classify_str(&format!(
            r#"{{"metadata":{{"message_type":"notification","message_id":"{id}"}},"payload":{{"event":{{}}}}}}"#
        ))
    }

    fn reconnect(url: Option<&str>) -> ClassifiedEvent {
        ClassifiedEvent::Reconnect {
            reconnect_url: url.map(str::to_string),
            requires_disconnect: true,
        }
    }

    fn frame(generation: u64, event: ClassifiedEvent) -> Input {
        Input::Frame { generation, event }
    }

    fn delivered_ids(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::DeliverNotification { envelope, .. } => {
                    envelope.metadata.message_id().map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    fn disconnects(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::DeliverDisconnected { .. }))
            .count()
    }

    /// Machine with generation 1 live as session `abc123`
    fn live_machine(config: SessionConfig) -> SessionMachine {
        let mut machine = SessionMachine::new(config, t(0));
        machine.handle(Input::Connect, t(0));
        machine.handle(Input::StreamOpened { generation: 1 }, t(0));
        machine.handle(frame(1, welcome("abc123", 10)), t(1));
        assert_eq!(machine.phase(), SessionPhase::Live);
        machine
    }

    #[test]
    fn test_connect_opens_default_endpoint() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        let effects = machine.handle(Input::Connect, t(0));

        assert_eq!(
            effects,
            vec![
                Effect::OpenStream {
                    generation: 1,
                    url: DEFAULT_ENDPOINT.to_string(),
                    delay: Duration::ZERO,
                },
                Effect::Transition {
                    from: SessionPhase::Idle,
                    to: SessionPhase::Connecting,
                    generation: 1,
                },
            ]
        );
        assert_eq!(machine.state().connection_generation, 1);
        assert!(!machine.state().is_connected);

        let effects = machine.handle(Input::StreamOpened { generation: 1 }, t(0));
        assert_eq!(
            effects,
            vec![Effect::ArmWelcomeTimeout {
                generation: 1,
                after: Duration::from_secs(10),
            }]
        );
    }

    #[test]
    fn test_second_connect_is_ignored() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(Input::Connect, t(2));
        assert!(matches!(effects.as_slice(), [Effect::Warning { .. }]));
        assert_eq!(machine.state().connection_generation, 1);
    }

    #[test]
    fn test_welcome_establishes_session() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        machine.handle(Input::Connect, t(0));
        machine.handle(Input::StreamOpened { generation: 1 }, t(0));
        let effects = machine.handle(frame(1, welcome("abc123", 10)), t(5));

        let state = machine.state();
        assert!(state.is_connected);
        assert_eq!(state.session_id.as_deref(), Some("abc123"));
        assert_eq!(state.keepalive_timeout_seconds, Some(10));
        assert_eq!(state.last_keepalive_time, t(5));
        assert_eq!(state.phase, SessionPhase::Live);

        assert_eq!(
            effects,
            vec![
                Effect::Transition {
                    from: SessionPhase::Connecting,
                    to: SessionPhase::Welcomed,
                    generation: 1,
                },
                Effect::Transition {
                    from: SessionPhase::Welcomed,
                    to: SessionPhase::Live,
                    generation: 1,
                },
                Effect::ArmKeepalive {
                    generation: 1,
                    after: Duration::from_secs(15),
                },
                Effect::DeliverWelcome {
                    generation: 1,
                    session_id: "abc123".to_string(),
                    reconnected: false,
                },
            ]
        );
    }

    #[test]
    fn test_welcome_without_session_id_warns() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        machine.handle(Input::Connect, t(0));
        let effects = machine.handle(frame(1, welcome("", 10)), t(1));

        assert!(effects.iter().any(|e| matches!(e, Effect::Warning { .. })));
        assert!(machine.state().is_connected);
        assert_eq!(machine.state().session_id.as_deref(), Some(""));
    }

    #[test]
    fn test_live_frames_refresh_liveness_and_deliver() {
        let mut machine = live_machine(SessionConfig::default());

        let effects = machine.handle(frame(1, ClassifiedEvent::SessionKeepalive), t(8));
        assert_eq!(
            effects,
            vec![Effect::ArmKeepalive {
                generation: 1,
                after: Duration::from_secs(15),
            }]
        );
        assert_eq!(machine.state().last_keepalive_time, t(8));

        let effects = machine.handle(frame(1, notification("n-1")), t(9));
        assert_eq!(delivered_ids(&effects), vec!["n-1"]);

        let effects = machine.handle(
            frame(
                1,
                ClassifiedEvent::Revocation {
                    subscription_id: "sub-1".to_string(),
                    status: "authorization_revoked".to_string(),
                },
            ),
            t(10),
        );
        assert!(effects.contains(&Effect::DeliverRevocation {
            subscription_id: "sub-1".to_string(),
            status: "authorization_revoked".to_string(),
        }));
        assert_eq!(machine.phase(), SessionPhase::Live);
        assert_eq!(machine.state().last_keepalive_time, t(10));
    }

    #[test]
    fn test_unknown_frame_changes_nothing() {
        let mut machine = live_machine(SessionConfig::default());
        let before = machine.state().clone();

        let effects = machine.handle(
            frame(1, classify_str(r#"{"metadata":{"message_type":"bogus"}}"#)),
            t(5),
        );
        assert_eq!(
            effects,
            vec![Effect::Ignored {
                generation: 1,
                reason: UnknownReason::UnrecognizedType("bogus".to_string()),
            }]
        );
        assert_eq!(machine.state(), &before);
    }

    #[test]
    fn test_duplicate_welcome_is_treated_as_keepalive() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(frame(1, welcome("other", 30)), t(4));

        assert!(effects.iter().any(|e| matches!(e, Effect::Warning { .. })));
        assert_eq!(machine.state().session_id.as_deref(), Some("abc123"));
        assert_eq!(machine.state().keepalive_timeout_seconds, Some(10));
        assert_eq!(machine.state().last_keepalive_time, t(4));
    }

    #[test]
    fn test_migration_keeps_old_stream_until_new_welcome() {
        let mut machine = live_machine(SessionConfig::default());

        let effects = machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(2));
        assert_eq!(
            effects,
            vec![
                Effect::ArmKeepalive {
                    generation: 1,
                    after: Duration::from_secs(15),
                },
                Effect::OpenStream {
                    generation: 2,
                    url: "wss://example/new".to_string(),
                    delay: Duration::ZERO,
                },
                Effect::Transition {
                    from: SessionPhase::Live,
                    to: SessionPhase::Reconnecting,
                    generation: 2,
                },
            ]
        );
        assert!(machine.state().is_connected);
        assert_eq!(machine.pending_url(), Some("wss://example/new"));

        // The old stream still delivers while the new one opens
        let effects = machine.handle(frame(1, notification("old-1")), t(3));
        assert_eq!(delivered_ids(&effects), vec!["old-1"]);

        // Early notifications on the new stream wait for its welcome
        machine.handle(Input::StreamOpened { generation: 2 }, t(3));
        let effects = machine.handle(frame(2, notification("new-1")), t(3));
        assert!(delivered_ids(&effects).is_empty());

        let effects = machine.handle(frame(2, welcome("def456", 10)), t(4));
        let close_at = effects
            .iter()
            .position(|e| *e == Effect::CloseStream { generation: 1 })
            .unwrap();
        let welcome_at = effects
            .iter()
            .position(|e| matches!(e, Effect::DeliverWelcome { .. }))
            .unwrap();
        assert!(close_at < welcome_at);
        assert!(effects.contains(&Effect::DeliverWelcome {
            generation: 2,
            session_id: "def456".to_string(),
            reconnected: true,
        }));
        assert_eq!(delivered_ids(&effects), vec!["new-1"]);
        assert_eq!(disconnects(&effects), 0);

        assert_eq!(machine.state().session_id.as_deref(), Some("def456"));
        assert_eq!(machine.active_generation(), Some(2));

        // Stale frames from the old stream are dropped
        let effects = machine.handle(frame(1, notification("old-2")), t(5));
        assert_eq!(
            effects,
            vec![Effect::Discarded {
                generation: 1,
                what: "frame",
            }]
        );
    }

    #[test]
    fn test_reconnect_without_url_uses_default_endpoint() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(frame(1, reconnect(None)), t(2));
        assert!(effects.contains(&Effect::OpenStream {
            generation: 2,
            url: DEFAULT_ENDPOINT.to_string(),
            delay: Duration::ZERO,
        }));
    }

    #[test]
    fn test_unusable_reconnect_url_uses_default_endpoint() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(frame(1, reconnect(Some("https://example/new"))), t(2));
        assert!(effects.iter().any(|e| matches!(e, Effect::Warning { .. })));
        assert!(effects.contains(&Effect::OpenStream {
            generation: 2,
            url: DEFAULT_ENDPOINT.to_string(),
            delay: Duration::ZERO,
        }));
        assert_eq!(machine.phase(), SessionPhase::Reconnecting);
    }

    #[test]
    fn test_huge_keepalive_interval_saturates() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        machine.handle(Input::Connect, t(0));
        machine.handle(Input::StreamOpened { generation: 1 }, t(0));

        let effects = machine.handle(frame(1, welcome("x", u64::MAX)), t(1));
        assert_eq!(machine.phase(), SessionPhase::Live);
        assert_eq!(machine.state().keepalive_timeout_seconds, Some(u64::MAX));
        assert!(effects.contains(&Effect::ArmKeepalive {
            generation: 1,
            after: Duration::MAX,
        }));

        let effects = machine.handle(frame(1, ClassifiedEvent::SessionKeepalive), t(2));
        assert!(effects.contains(&Effect::ArmKeepalive {
            generation: 1,
            after: Duration::MAX,
        }));
    }

    #[test]
    fn test_absent_or_zero_keepalive_uses_default() {
        for advertised in [None, Some(0)] {
            let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
            machine.handle(Input::Connect, t(0));
            machine.handle(Input::StreamOpened { generation: 1 }, t(0));

            let welcome = ClassifiedEvent::SessionWelcome {
                session_id: "x".to_string(),
                keepalive_timeout_seconds: advertised,
            };
            let effects = machine.handle(frame(1, welcome), t(1));
            assert_eq!(machine.phase(), SessionPhase::Live);
            // 10s default times the 1.5 grace factor
            assert!(effects.contains(&Effect::ArmKeepalive {
                generation: 1,
                after: Duration::from_secs(15),
            }));
        }
    }

    #[test]
    fn test_migrating_stream_frames_refresh_liveness() {
        let mut machine = live_machine(SessionConfig::default());
        machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(2));
        assert_eq!(machine.state().last_keepalive_time, t(2));

        machine.handle(frame(2, ClassifiedEvent::SessionKeepalive), t(5));
        assert_eq!(machine.state().last_keepalive_time, t(5));

        machine.handle(frame(2, notification("early")), t(7));
        assert_eq!(machine.state().last_keepalive_time, t(7));

        let unknown = ClassifiedEvent::Unknown {
            reason: UnknownReason::Malformed,
        };
        machine.handle(frame(2, unknown), t(9));
        assert_eq!(machine.state().last_keepalive_time, t(7));
    }

    #[test]
    fn test_unusable_endpoint_stops_without_retrying() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        machine.handle(Input::Connect, t(0));

        let effects = machine.handle(
            Input::OpenFailed {
                generation: 1,
                reason: "bad url".to_string(),
                retryable: false,
            },
            t(1),
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenStream { .. })));
        assert!(effects.contains(&Effect::DeliverDisconnected {
            reason: DisconnectReason::RetriesExhausted {
                attempts: 1,
                last_error: "bad url".to_string(),
            },
        }));
        assert_eq!(machine.phase(), SessionPhase::Closed);
    }

    #[test]
    fn test_rejected_migration_target_falls_back_immediately() {
        let mut machine = live_machine(SessionConfig::default());
        machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(2));

        let effects = machine.handle(
            Input::OpenFailed {
                generation: 2,
                reason: "bad url".to_string(),
                retryable: false,
            },
            t(3),
        );
        assert!(effects.contains(&Effect::OpenStream {
            generation: 3,
            url: DEFAULT_ENDPOINT.to_string(),
            delay: Duration::ZERO,
        }));
        assert!(machine.state().is_connected);
    }

    #[test]
    fn test_second_reconnect_during_migration_is_ignored() {
        let mut machine = live_machine(SessionConfig::default());
        machine.handle(frame(1, reconnect(Some("wss://example/a"))), t(2));
        let effects = machine.handle(frame(1, reconnect(Some("wss://example/b"))), t(3));
        assert!(effects.iter().any(|e| matches!(e, Effect::Warning { .. })));
        assert_eq!(machine.pending_url(), Some("wss://example/a"));
    }

    #[test]
    fn test_keepalive_expiry_reconnects_without_disconnect() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(Input::KeepaliveExpired { generation: 1 }, t(20));

        assert_eq!(
            effects,
            vec![
                Effect::CloseStream { generation: 1 },
                Effect::OpenStream {
                    generation: 2,
                    url: DEFAULT_ENDPOINT.to_string(),
                    delay: Duration::ZERO,
                },
                Effect::Transition {
                    from: SessionPhase::Live,
                    to: SessionPhase::Reconnecting,
                    generation: 2,
                },
            ]
        );
        assert!(!machine.state().is_connected);
        assert_eq!(machine.state().session_id, None);

        let effects = machine.handle(frame(2, welcome("recovered", 10)), t(21));
        assert!(effects.contains(&Effect::DeliverWelcome {
            generation: 2,
            session_id: "recovered".to_string(),
            reconnected: true,
        }));
    }

    #[test]
    fn test_stale_keepalive_expiry_is_discarded() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(Input::KeepaliveExpired { generation: 7 }, t(20));
        assert!(matches!(effects.as_slice(), [Effect::Discarded { .. }]));
        assert_eq!(machine.phase(), SessionPhase::Live);
    }

    #[test]
    fn test_stream_end_on_live_stream_reconnects() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(
            Input::StreamEnded {
                generation: 1,
                reason: "connection reset".to_string(),
            },
            t(3),
        );
        assert_eq!(machine.phase(), SessionPhase::Reconnecting);
        assert_eq!(disconnects(&effects), 0);
        assert_eq!(machine.last_error(), Some("connection reset"));
    }

    #[test]
    fn test_recovery_disabled_closes() {
        let config =
            SessionConfig::default().with_reconnect_config(ReconnectConfig::disabled());
        let mut machine = live_machine(config);
        let effects = machine.handle(Input::KeepaliveExpired { generation: 1 }, t(20));

        assert_eq!(machine.phase(), SessionPhase::Closed);
        assert_eq!(disconnects(&effects), 1);
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenStream { .. })));
    }

    #[test]
    fn test_migration_still_honoured_when_recovery_disabled() {
        let config =
            SessionConfig::default().with_reconnect_config(ReconnectConfig::disabled());
        let mut machine = live_machine(config);
        let effects = machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(2));
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenStream { generation: 2, .. })));
    }

    #[test]
    fn test_retries_back_off_then_close_once() {
        let reconnect = ReconnectConfig::default()
            .with_max_retries(3)
            .with_jitter(0.0);
        let config = SessionConfig::default().with_reconnect_config(reconnect);
        let mut machine = SessionMachine::new(config, t(0));
        machine.handle(Input::Connect, t(0));

        let mut all = Vec::new();
        let mut delays = Vec::new();
        for attempt in 1..=3 {
            let effects = machine.handle(
                Input::OpenFailed {
                    generation: attempt,
                    reason: "refused".to_string(),
                    retryable: true,
                },
                t(attempt as i64),
            );
            delays.extend(effects.iter().filter_map(|e| match e {
                Effect::OpenStream { delay, .. } => Some(*delay),
                _ => None,
            }));
            all.extend(effects);
        }

        assert_eq!(
            delays,
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
        assert_eq!(machine.phase(), SessionPhase::Closed);
        assert_eq!(disconnects(&all), 1);
        assert!(all.contains(&Effect::DeliverDisconnected {
            reason: DisconnectReason::RetriesExhausted {
                attempts: 3,
                last_error: "refused".to_string(),
            },
        }));

        // No automatic retry afterwards; an explicit connect starts over
        let effects = machine.handle(Input::Connect, t(10));
        assert!(effects.contains(&Effect::OpenStream {
            generation: 4,
            url: DEFAULT_ENDPOINT.to_string(),
            delay: Duration::ZERO,
        }));
        assert_eq!(machine.state().consecutive_failures, 0);
    }

    #[test]
    fn test_welcome_timeout_counts_as_failure() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        machine.handle(Input::Connect, t(0));
        machine.handle(Input::StreamOpened { generation: 1 }, t(0));

        let effects = machine.handle(Input::WelcomeTimedOut { generation: 1 }, t(10));
        assert_eq!(effects[0], Effect::CloseStream { generation: 1 });
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenStream { generation: 2, .. })));
        assert_eq!(machine.state().consecutive_failures, 1);
        assert_eq!(machine.phase(), SessionPhase::Connecting);
    }

    #[test]
    fn test_failed_migration_falls_back_to_default_endpoint() {
        let mut machine = live_machine(SessionConfig::default());
        machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(2));

        let effects = machine.handle(
            Input::OpenFailed {
                generation: 2,
                reason: "refused".to_string(),
                retryable: true,
            },
            t(3),
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::OpenStream { generation: 3, url, delay } if url == DEFAULT_ENDPOINT && !delay.is_zero()
        )));
        assert!(machine.state().is_connected);

        // The old stream keeps delivering meanwhile
        let effects = machine.handle(frame(1, notification("still-here")), t(4));
        assert_eq!(delivered_ids(&effects), vec!["still-here"]);
    }

    #[test]
    fn test_old_stream_lost_during_migration_waits_for_new_welcome() {
        let mut machine = live_machine(SessionConfig::default());
        machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(2));

        let effects = machine.handle(
            Input::StreamEnded {
                generation: 1,
                reason: "closed".to_string(),
            },
            t(3),
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenStream { .. })));
        assert!(!machine.state().is_connected);
        assert_eq!(machine.pending_generation(), Some(2));

        machine.handle(frame(2, welcome("def456", 10)), t(4));
        assert!(machine.state().is_connected);
        assert_eq!(machine.phase(), SessionPhase::Live);
    }

    #[test]
    fn test_migration_buffer_is_bounded() {
        let config = SessionConfig::default().with_migration_buffer_capacity(2);
        let mut machine = live_machine(config);
        machine.handle(frame(1, reconnect(None)), t(2));

        machine.handle(frame(2, notification("a")), t(3));
        machine.handle(frame(2, notification("b")), t(3));
        let effects = machine.handle(frame(2, notification("c")), t(3));
        assert!(matches!(effects.as_slice(), [Effect::Warning { .. }]));

        let effects = machine.handle(frame(2, welcome("def456", 10)), t(4));
        assert_eq!(delivered_ids(&effects), vec!["a", "b"]);
    }

    #[test]
    fn test_disconnect_from_live() {
        let mut machine = live_machine(SessionConfig::default());
        let effects = machine.handle(Input::Disconnect, t(3));

        assert_eq!(
            effects,
            vec![
                Effect::CloseStream { generation: 1 },
                Effect::Transition {
                    from: SessionPhase::Live,
                    to: SessionPhase::Closed,
                    generation: 1,
                },
                Effect::DeliverDisconnected {
                    reason: DisconnectReason::Requested,
                },
            ]
        );
        assert!(!machine.state().is_connected);
        assert_eq!(machine.state().session_id, None);

        // Frames racing the close are stale
        let effects = machine.handle(frame(1, notification("late")), t(4));
        assert!(delivered_ids(&effects).is_empty());
    }

    #[test]
    fn test_disconnect_when_stopped_is_silent() {
        let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
        assert!(machine.handle(Input::Disconnect, t(1)).is_empty());
        assert_eq!(machine.phase(), SessionPhase::Idle);

        let mut machine = live_machine(SessionConfig::default());
        machine.handle(Input::Disconnect, t(2));
        assert!(machine.handle(Input::Disconnect, t(3)).is_empty());
    }

    #[test]
    fn test_disconnect_during_migration_closes_both_streams() {
        let mut machine = live_machine(SessionConfig::default());
        machine.handle(frame(1, reconnect(None)), t(2));
        let effects = machine.handle(Input::Disconnect, t(3));

        assert!(effects.contains(&Effect::CloseStream { generation: 1 }));
        assert!(effects.contains(&Effect::CloseStream { generation: 2 }));
        assert_eq!(disconnects(&effects), 1);
    }

    #[test]
    fn test_restore_keeps_generation() {
        let machine = live_machine(SessionConfig::default());
        let mut restored = SessionMachine::restore(SessionConfig::default(), machine.state().clone());

        assert_eq!(restored.phase(), SessionPhase::Closed);
        assert!(!restored.state().is_connected);
        assert_eq!(restored.state().last_keepalive_time, t(1));

        let effects = restored.handle(Input::Connect, t(5));
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenStream { generation: 2, .. })));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_event() -> impl Strategy<Value = ClassifiedEvent> {
            prop_oneof![
                Just(ClassifiedEvent::SessionKeepalive),
                Just(ClassifiedEvent::Unknown {
                    reason: UnknownReason::Malformed
                }),
                "[a-z]{1,8}".prop_map(|id| notification(&id)),
                Just(ClassifiedEvent::Revocation {
                    subscription_id: "sub".to_string(),
                    status: "revoked".to_string(),
                }),
            ]
        }

        proptest! {
            /// last_keepalive_time never moves backwards, whatever the clock does,
            /// and frames on the migrating stream count as proof of life too
            #[test]
            fn prop_keepalive_is_monotonic(
                steps in prop::collection::vec((arb_event(), -30i64..30, any::<bool>()), 1..64)
            ) {
                let mut machine = live_machine(SessionConfig::default());
                machine.handle(frame(1, reconnect(Some("wss://example/new"))), t(1));
                prop_assert_eq!(machine.pending_generation(), Some(2));
                let mut previous = machine.state().last_keepalive_time;

                for (event, offset, on_pending) in steps {
                    let proves_liveness = event.proves_liveness();
                    let now = t(1 + offset);
                    let generation = if on_pending { 2 } else { 1 };
                    machine.handle(frame(generation, event), now);

                    let current = machine.state().last_keepalive_time;
                    prop_assert!(current >= previous);
                    if proves_liveness {
                        prop_assert!(current >= now);
                    } else {
                        prop_assert_eq!(current, previous);
                    }
                    previous = current;
                }
            }

            /// Connected always implies a session id
            #[test]
            fn prop_connected_implies_session_id(
                inputs in prop::collection::vec(0u8..7, 1..64)
            ) {
                let mut machine = SessionMachine::new(SessionConfig::default(), t(0));
                for (i, choice) in inputs.into_iter().enumerate() {
                    let generation = machine.state().connection_generation;
                    let input = match choice {
                        0 => Input::Connect,
                        1 => frame(generation, welcome("s", 10)),
                        2 => frame(generation, reconnect(None)),
                        3 => Input::KeepaliveExpired { generation: machine.active_generation().unwrap_or(0) },
                        4 => Input::OpenFailed { generation, reason: "x".to_string(), retryable: true },
                        5 => Input::StreamOpened { generation },
                        _ => Input::Disconnect,
                    };
                    machine.handle(input, t(i as i64));
                    let state = machine.state();
                    prop_assert!(!state.is_connected || state.session_id.is_some());
                }
            }
        }
    }
}
