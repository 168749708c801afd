//! The session client.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eventsub_transport::{StreamConnector, WebSocketConnector};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::envelope::Envelope;
use crate::error::SessionResult;
use crate::events::SessionEvent;
use crate::handlers::{
    DisconnectFn, DisconnectHandler, HandlerResult, NotificationFn, NotificationHandler,
    RevocationFn, RevocationHandler, SessionWelcomeHandler, WelcomeFn,
};
use crate::metrics::SessionMetricsSnapshot;
use crate::state::{DisconnectReason, Input, SessionMachine, SessionPhase, SessionState};
use crate::tasks::{Driver, Shared};

#[derive(Debug)]
struct RunningDriver {
    cancel: CancellationToken,
    handle: JoinHandle<SessionMachine>,
}

impl RunningDriver {
    /// Handlers run on the driver task, so a call from one of them lands here
    fn is_current_task(&self) -> bool {
        task::try_id() == Some(self.handle.id())
    }
}

#[derive(Debug)]
struct DriverSlot {
    /// Present while no driver runs
    machine: Option<SessionMachine>,
    running: Option<RunningDriver>,
}

/// Client for one event-subscription session.
///
/// The client owns a background driver while connected. Queries read a
/// snapshot the driver publishes after every step, so they never wait on the
/// connection.
///
/// # Example
///
/// ```rust,no_run
/// use eventsub_session::{SessionClient, SessionConfig};
///
/// # async fn example() -> eventsub_session::SessionResult<()> {
/// let client = SessionClient::with_websocket(SessionConfig::default());
/// client.on_notification(|envelope| async move {
///     println!("{:?}", envelope.payload.event);
///     Ok(())
/// });
/// client.connect().await?;
/// // ...
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SessionClient {
    config: SessionConfig,
    connector: Arc<dyn StreamConnector>,
    shared: Arc<Shared>,
    driver: AsyncMutex<DriverSlot>,
}

impl SessionClient {
    /// Create a disconnected client using `connector` to open streams.
    pub fn new(config: SessionConfig, connector: impl StreamConnector + 'static) -> Self {
        let machine = SessionMachine::new(config.clone(), Utc::now());
        let shared = Arc::new(Shared::new(machine.state().clone()));
        Self {
            config,
            connector: Arc::new(connector),
            shared,
            driver: AsyncMutex::new(DriverSlot {
                machine: Some(machine),
                running: None,
            }),
        }
    }

    /// Create a disconnected client on the default WebSocket connector.
    pub fn with_websocket(config: SessionConfig) -> Self {
        Self::new(config, WebSocketConnector::default())
    }

    /// The client's configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start the session.
    ///
    /// Returns as soon as the first connection attempt is under way; the
    /// session becomes connected when its welcome arrives. Calling this while
    /// a session is running logs a warning and does nothing.
    ///
    /// May be called from a disconnect handler to start over once the
    /// session has stopped.
    ///
    /// # Errors
    ///
    /// Fails only when the configuration is invalid.
    pub async fn connect(&self) -> SessionResult<()> {
        self.config.validate()?;

        let mut slot = self.driver.lock().await;
        let mut machine = loop {
            let Some(running) = slot.running.take() else {
                break slot.machine.take().unwrap_or_else(|| self.restored());
            };

            // A driver that died without closing the session counts as stopped
            let phase = self.shared.state.read().phase;
            if !phase.is_stopped() && !running.handle.is_finished() {
                slot.running = Some(running);
                warn!("connect() called while the session is running, ignoring");
                return Ok(());
            }
            if running.is_current_task() {
                // The stopped driver exits once this handler returns; it keeps its machine
                debug!("Restarting the session from a handler");
                break self.restored();
            }

            drop(slot);
            let machine = self.join(running).await;
            slot = self.driver.lock().await;
            if slot.running.is_none() && slot.machine.is_none() {
                slot.machine = Some(machine);
            }
        };

        let initial = machine.handle(Input::Connect, Utc::now());
        self.shared.publish(machine.state());

        let cancel = CancellationToken::new();
        let driver = Driver::new(
            machine,
            &self.config,
            self.connector.clone(),
            self.shared.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(driver.run(initial));
        slot.running = Some(RunningDriver { cancel, handle });

        info!("Session connecting to {}", self.config.endpoint);
        Ok(())
    }

    /// Stop the session.
    ///
    /// Closes every stream and waits for the driver and all readers to stop,
    /// so no handler runs after this returns. Disconnect handlers fire unless
    /// the session was already stopped. Safe to call at any time.
    ///
    /// Called from inside a handler it only requests the stop and returns
    /// immediately: the driver finishes once the handler returns, and the
    /// disconnect handlers run after that.
    pub async fn disconnect(&self) {
        let mut slot = self.driver.lock().await;
        if let Some(running) = slot.running.take() {
            running.cancel.cancel();
            if running.is_current_task() {
                debug!("Session stop requested from a handler");
                slot.running = Some(running);
                return;
            }

            // Handlers may call back into the client while the driver winds down
            drop(slot);
            let machine = self.join(running).await;
            slot = self.driver.lock().await;
            if slot.running.is_some() {
                debug!("Session restarted by a disconnect handler");
                return;
            }
            if slot.machine.is_none() {
                slot.machine = Some(machine);
            }
        }

        let machine = slot.machine.get_or_insert_with(|| self.restored());
        // A driver that stopped by itself left the machine closed; this only resets fields
        let leftover = machine.handle(Input::Disconnect, Utc::now());
        debug_assert!(leftover.is_empty());
        self.shared.publish(machine.state());
        debug!("Session disconnected");
    }

    /// Wait for a driver to stop and take its machine back.
    async fn join(&self, running: RunningDriver) -> SessionMachine {
        match running.handle.await {
            Ok(machine) => machine,
            Err(e) => {
                error!("Session driver ended abnormally: {}", e);
                self.restored()
            }
        }
    }

    /// Machine rebuilt from the last published snapshot
    fn restored(&self) -> SessionMachine {
        let state = self.shared.state.read().clone();
        SessionMachine::restore(self.config.clone(), state)
    }

    /// Current session id
    pub fn session_id(&self) -> Option<String> {
        self.shared.state.read().session_id.clone()
    }

    /// Whether a welcomed stream is live
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().is_connected
    }

    /// Last proof of life
    pub fn last_keepalive_time(&self) -> DateTime<Utc> {
        self.shared.state.read().last_keepalive_time
    }

    /// Keepalive interval advertised by the current session
    pub fn keepalive_timeout_seconds(&self) -> Option<u64> {
        self.shared.state.read().keepalive_timeout_seconds
    }

    /// Generation of the most recently opened stream
    pub fn connection_generation(&self) -> u64 {
        self.shared.state.read().connection_generation
    }

    /// Lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        self.shared.state.read().phase
    }

    /// Consistent copy of the whole observable state
    pub fn snapshot(&self) -> SessionState {
        self.shared.state.read().clone()
    }

    /// Counter snapshot
    pub fn metrics(&self) -> SessionMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Receive lifecycle events from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Register a notification handler
    pub fn add_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.shared.handlers.write().add_notification_handler(handler);
    }

    /// Register a welcome handler
    pub fn add_welcome_handler(&self, handler: Arc<dyn SessionWelcomeHandler>) {
        self.shared.handlers.write().add_welcome_handler(handler);
    }

    /// Register a disconnect handler
    pub fn add_disconnect_handler(&self, handler: Arc<dyn DisconnectHandler>) {
        self.shared.handlers.write().add_disconnect_handler(handler);
    }

    /// Register a revocation handler
    pub fn add_revocation_handler(&self, handler: Arc<dyn RevocationHandler>) {
        self.shared.handlers.write().add_revocation_handler(handler);
    }

    /// Register a closure called for every notification
    pub fn on_notification<F, Fut>(&self, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.add_notification_handler(Arc::new(NotificationFn(handler)));
    }

    /// Register a closure called with each new session id
    pub fn on_session_welcome<F, Fut>(&self, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.add_welcome_handler(Arc::new(WelcomeFn(handler)));
    }

    /// Register a closure called when the session stops
    pub fn on_disconnected<F, Fut>(&self, handler: F)
    where
        F: Fn(DisconnectReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.add_disconnect_handler(Arc::new(DisconnectFn(handler)));
    }

    /// Register a closure called with `(subscription_id, status)` on revocation
    pub fn on_revocation<F, Fut>(&self, handler: F)
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.add_revocation_handler(Arc::new(RevocationFn(handler)));
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(running) = self.driver.get_mut().running.as_ref() {
            running.cancel.cancel();
        }
    }
}
