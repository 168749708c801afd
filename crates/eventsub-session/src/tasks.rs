//! Background tasks for the session client.
//!
//! Two kinds of task cooperate:
//!
//! - one **reader** per physical stream. It waits out its backoff delay, opens
//!   the stream, classifies every frame and forwards it to the driver tagged
//!   with its generation. It owns the stream exclusively and closes it when
//!   cancelled.
//! - a single **driver** that owns the [`SessionMachine`], turns reader
//!   messages and timer expiries into machine inputs, and executes the
//!   resulting effects: spawning and joining readers, arming timers, and
//!   invoking handlers. Nothing else mutates session state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eventsub_transport::{FrameStream, StreamConnector};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::classifier::{ClassifiedEvent, classify};
use crate::config::SessionConfig;
use crate::dedup::DeduplicationCache;
use crate::envelope::Envelope;
use crate::events::{SessionEvent, SessionEventEmitter};
use crate::handlers::HandlerRegistry;
use crate::metrics::SessionMetrics;
use crate::state::{DisconnectReason, Effect, Input, SessionMachine, SessionPhase, SessionState};

/// Upper bound for a reader's close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the client handle and its driver.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: RwLock<SessionState>,
    pub(crate) handlers: RwLock<HandlerRegistry>,
    pub(crate) metrics: SessionMetrics,
    pub(crate) events: SessionEventEmitter,
}

impl Shared {
    pub(crate) fn new(state: SessionState) -> Self {
        Self {
            state: RwLock::new(state),
            handlers: RwLock::new(HandlerRegistry::new()),
            metrics: SessionMetrics::new(),
            events: SessionEventEmitter::new(),
        }
    }

    pub(crate) fn publish(&self, state: &SessionState) {
        self.state.write().clone_from(state);
    }
}

/// What a reader reports to the driver.
#[derive(Debug)]
enum ReaderMessage {
    Opened {
        generation: u64,
    },
    Frame {
        generation: u64,
        event: ClassifiedEvent,
    },
    Ended {
        generation: u64,
        reason: String,
    },
    OpenFailed {
        generation: u64,
        reason: String,
        retryable: bool,
    },
}

#[derive(Debug)]
struct ReaderHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Spawn the reader task for one stream generation
fn spawn_reader(
    generation: u64,
    url: String,
    delay: Duration,
    connector: Arc<dyn StreamConnector>,
    tx: mpsc::Sender<ReaderMessage>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !delay.is_zero() {
            debug!(
                "Generation {} waiting {:?} before connecting to {}",
                generation, delay, url
            );
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep(delay) => {}
            }
        }

        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            result = connector.open_stream(&url) => result,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Generation {} failed to connect to {}: {}", generation, url, e);
                let failed = ReaderMessage::OpenFailed {
                    generation,
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                };
                forward(&tx, &cancel, failed).await;
                return;
            }
        };

        debug!("Generation {} reader started on {}", generation, url);
        if forward(&tx, &cancel, ReaderMessage::Opened { generation }).await {
            read_loop(generation, stream.as_mut(), &tx, &cancel, &shared).await;
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, stream.close()).await {
            Ok(Ok(())) => trace!("Generation {} stream closed", generation),
            Ok(Err(e)) => debug!("Generation {} close failed: {}", generation, e),
            Err(_) => debug!("Generation {} close timed out", generation),
        }
        debug!("Generation {} reader stopped", generation);
    })
}

async fn read_loop(
    generation: u64,
    stream: &mut dyn FrameStream,
    tx: &mpsc::Sender<ReaderMessage>,
    cancel: &CancellationToken,
    shared: &Shared,
) {
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            read = stream.read_frame() => read,
        };

        let message = match read {
            Ok(Some(frame)) => {
                SessionMetrics::incr(&shared.metrics.frames_received);
                let event = classify(frame.payload());
                trace!("Generation {} received {}", generation, event.kind());
                ReaderMessage::Frame { generation, event }
            }
            Ok(None) => ReaderMessage::Ended {
                generation,
                reason: "stream closed by peer".to_string(),
            },
            Err(e) => ReaderMessage::Ended {
                generation,
                reason: e.to_string(),
            },
        };

        let ended = matches!(message, ReaderMessage::Ended { .. });
        if !forward(tx, cancel, message).await || ended {
            return;
        }
    }
}

/// Send to the driver unless cancelled first. Returns whether it was sent.
async fn forward(
    tx: &mpsc::Sender<ReaderMessage>,
    cancel: &CancellationToken,
    message: ReaderMessage,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// The task that owns the session state machine.
pub(crate) struct Driver {
    machine: SessionMachine,
    connector: Arc<dyn StreamConnector>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    readers: HashMap<u64, ReaderHandle>,
    frames_tx: mpsc::Sender<ReaderMessage>,
    frames_rx: mpsc::Receiver<ReaderMessage>,
    keepalive: Option<(u64, Instant)>,
    welcome: Option<(u64, Instant)>,
    dedup: Option<DeduplicationCache>,
}

impl Driver {
    pub(crate) fn new(
        machine: SessionMachine,
        config: &SessionConfig,
        connector: Arc<dyn StreamConnector>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_channel_capacity);
        Self {
            machine,
            connector,
            shared,
            cancel,
            readers: HashMap::new(),
            frames_tx,
            frames_rx,
            keepalive: None,
            welcome: None,
            dedup: config
                .dedup
                .enabled
                .then(|| DeduplicationCache::from_config(&config.dedup)),
        }
    }

    /// Execute `initial` effects, then drive the session until it closes or is
    /// cancelled. Hands the machine back so the next connect continues its
    /// generation count.
    pub(crate) async fn run(mut self, initial: Vec<Effect>) -> SessionMachine {
        self.execute_all(initial).await;

        while self.machine.phase() != SessionPhase::Closed {
            let keepalive_at = self.keepalive.map(|(_, at)| at);
            let welcome_at = self.welcome.map(|(_, at)| at);

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("Session driver cancelled");
                    self.apply(Input::Disconnect).await;
                    break;
                }
                Some(message) = self.frames_rx.recv() => {
                    self.on_reader_message(message).await;
                }
                () = deadline(keepalive_at) => {
                    if let Some((generation, _)) = self.keepalive.take() {
                        warn!(
                            "Keepalive deadline passed on generation {} (session {:?})",
                            generation,
                            self.machine.state().session_id
                        );
                        SessionMetrics::incr(&self.shared.metrics.keepalive_timeouts);
                        self.shared.events.emit(SessionEvent::ConnectionLost {
                            generation,
                            reason: "keepalive timeout".to_string(),
                        });
                        self.apply(Input::KeepaliveExpired { generation }).await;
                    }
                }
                () = deadline(welcome_at) => {
                    if let Some((generation, _)) = self.welcome.take() {
                        warn!("Generation {} sent no welcome in time", generation);
                        self.connection_failed(generation, "welcome timeout");
                        self.apply(Input::WelcomeTimedOut { generation }).await;
                    }
                }
            }
        }

        self.stop_readers().await;
        info!(
            "Session driver stopped at generation {}",
            self.machine.state().connection_generation
        );
        self.machine
    }

    async fn on_reader_message(&mut self, message: ReaderMessage) {
        let input = match message {
            ReaderMessage::Opened { generation } => {
                debug!("Generation {} stream open", generation);
                Input::StreamOpened { generation }
            }
            ReaderMessage::Frame { generation, event } => Input::Frame { generation, event },
            ReaderMessage::Ended { generation, reason } => {
                if self.machine.active_generation() == Some(generation) {
                    warn!("Generation {} connection lost: {}", generation, reason);
                    self.shared.events.emit(SessionEvent::ConnectionLost {
                        generation,
                        reason: reason.clone(),
                    });
                } else if self.machine.pending_generation() == Some(generation) {
                    self.connection_failed(generation, &reason);
                }
                Input::StreamEnded { generation, reason }
            }
            ReaderMessage::OpenFailed {
                generation,
                reason,
                retryable,
            } => {
                // The reader has already exited
                if let Some(reader) = self.readers.remove(&generation) {
                    let _ = reader.handle.await;
                }
                if self.machine.pending_generation() == Some(generation) {
                    self.connection_failed(generation, &reason);
                }
                Input::OpenFailed {
                    generation,
                    reason,
                    retryable,
                }
            }
        };
        self.apply(input).await;
    }

    fn connection_failed(&self, generation: u64, error: &str) {
        SessionMetrics::incr(&self.shared.metrics.connection_failures);
        self.shared.events.emit(SessionEvent::ConnectionFailed {
            generation,
            error: error.to_string(),
        });
    }

    async fn apply(&mut self, input: Input) {
        let effects = self.machine.handle(input, Utc::now());
        self.execute_all(effects).await;
    }

    async fn execute_all(&mut self, effects: Vec<Effect>) {
        self.shared.publish(self.machine.state());
        for effect in effects {
            self.execute(effect).await;
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Transition {
                from,
                to,
                generation,
            } => {
                info!(
                    "Session {} -> {} (generation {})",
                    from, to, generation
                );
                self.shared.events.emit_phase_changed(from, to, generation);
            }
            Effect::OpenStream {
                generation,
                url,
                delay,
            } => {
                info!("Opening generation {} to {}", generation, url);
                self.shared.events.emit(SessionEvent::Connecting {
                    generation,
                    url: url.clone(),
                });
                let cancel = self.cancel.child_token();
                let handle = spawn_reader(
                    generation,
                    url,
                    delay,
                    self.connector.clone(),
                    self.frames_tx.clone(),
                    cancel.clone(),
                    self.shared.clone(),
                );
                self.readers
                    .insert(generation, ReaderHandle { cancel, handle });
            }
            Effect::CloseStream { generation } => self.close_reader(generation).await,
            Effect::ArmKeepalive { generation, after } => {
                trace!("Keepalive for generation {} armed for {:?}", generation, after);
                // Past the clock's range the deadline never fires
                self.keepalive = Instant::now().checked_add(after).map(|at| (generation, at));
            }
            Effect::ArmWelcomeTimeout { generation, after } => {
                self.welcome = Instant::now().checked_add(after).map(|at| (generation, at));
            }
            Effect::DeliverWelcome {
                generation,
                session_id,
                reconnected,
            } => {
                if self.welcome.is_some_and(|(armed, _)| armed == generation) {
                    self.welcome = None;
                }
                if reconnected {
                    SessionMetrics::incr(&self.shared.metrics.reconnects);
                }
                info!(
                    "Session {} welcomed on generation {}{}",
                    session_id,
                    generation,
                    if reconnected { " (reconnected)" } else { "" }
                );
                self.shared.events.emit(SessionEvent::Welcomed {
                    generation,
                    session_id: session_id.clone(),
                    reconnected,
                });
                let handlers = self.handlers();
                let failures = handlers.dispatch_welcome(&session_id).await;
                self.count_handler_failures(failures);
            }
            Effect::DeliverNotification {
                generation,
                envelope,
            } => self.deliver_notification(generation, &envelope).await,
            Effect::DeliverRevocation {
                subscription_id,
                status,
            } => {
                warn!("Subscription {} revoked: {}", subscription_id, status);
                let handlers = self.handlers();
                let failures = handlers
                    .dispatch_revocation(&subscription_id, &status)
                    .await;
                self.count_handler_failures(failures);
            }
            Effect::DeliverDisconnected { reason } => {
                match &reason {
                    DisconnectReason::Requested => info!("Session disconnected: {}", reason),
                    _ => error!("Session disconnected: {}", reason),
                }
                self.shared.events.emit_disconnected(reason.clone());
                let handlers = self.handlers();
                let failures = handlers.dispatch_disconnected(&reason).await;
                self.count_handler_failures(failures);
            }
            Effect::Discarded { generation, what } => {
                SessionMetrics::incr(&self.shared.metrics.stale_discarded);
                trace!("Discarded {} from superseded generation {}", what, generation);
            }
            Effect::Ignored { generation, reason } => {
                SessionMetrics::incr(&self.shared.metrics.unknown_frames);
                debug!("Ignoring frame on generation {}: {}", generation, reason);
            }
            Effect::Warning { message } => warn!("{}", message),
        }
    }

    async fn deliver_notification(&mut self, generation: u64, envelope: &Envelope) {
        if let (Some(dedup), Some(message_id)) =
            (self.dedup.as_mut(), envelope.metadata.message_id())
        {
            if dedup.is_duplicate(message_id) {
                SessionMetrics::incr(&self.shared.metrics.duplicates_dropped);
                debug!(
                    "Dropping redelivered notification {} on generation {}",
                    message_id, generation
                );
                return;
            }
        }

        SessionMetrics::incr(&self.shared.metrics.notifications_delivered);
        trace!(
            "Delivering {} notification on generation {}",
            envelope.subscription_type().unwrap_or("untyped"),
            generation
        );
        let handlers = self.handlers();
        let failures = handlers.dispatch_notification(envelope).await;
        self.count_handler_failures(failures);
    }

    fn handlers(&self) -> HandlerRegistry {
        self.shared.handlers.read().clone()
    }

    fn count_handler_failures(&self, failures: u64) {
        if failures > 0 {
            self.shared
                .metrics
                .handler_failures
                .fetch_add(failures, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Cancel a reader and wait until it has stopped.
    async fn close_reader(&mut self, generation: u64) {
        if self.keepalive.is_some_and(|(armed, _)| armed == generation) {
            self.keepalive = None;
        }
        if self.welcome.is_some_and(|(armed, _)| armed == generation) {
            self.welcome = None;
        }

        let Some(reader) = self.readers.remove(&generation) else {
            return;
        };
        reader.cancel.cancel();
        if let Err(e) = reader.handle.await {
            error!("Generation {} reader failed: {}", generation, e);
        }
        debug!("Generation {} closed", generation);
    }

    async fn stop_readers(&mut self) {
        let generations: Vec<u64> = self.readers.keys().copied().collect();
        for generation in generations {
            self.close_reader(generation).await;
        }
    }
}
