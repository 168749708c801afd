//! Handler traits and registry.
//!
//! Handlers are how callers hear about a session: welcomes, notifications,
//! revocations and disconnects. Each kind is a small async trait; any number
//! of handlers can be registered per kind and they run in registration order
//! on the driver task, one at a time, before the next frame is processed.
//! Keep them fast: a slow handler delays everything behind it, including the
//! keepalive watchdog's view of the stream.
//!
//! A handler that returns an error or panics is logged and counted; the
//! remaining handlers still run and the session carries on.
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use eventsub_session::{Envelope, HandlerResult, NotificationHandler};
//!
//! #[derive(Debug)]
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl NotificationHandler for PrintHandler {
//!     async fn handle_notification(&self, notification: &Envelope) -> HandlerResult<()> {
//!         println!("{:?}", notification.subscription_type());
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt as _;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::envelope::Envelope;
use crate::state::DisconnectReason;

/// Errors returned by handlers
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HandlerError {
    /// Generic handler failure
    #[error("Handler failed: {message}")]
    Failed {
        /// What went wrong
        message: String,
    },

    /// External system error (e.g. a database or a downstream service)
    #[error("External system error: {source}")]
    External {
        /// The underlying error
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Result type for handler operations
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Receives notifications.
#[async_trait]
pub trait NotificationHandler: Send + Sync + fmt::Debug {
    /// Called once per delivered notification.
    async fn handle_notification(&self, notification: &Envelope) -> HandlerResult<()>;
}

/// Receives session welcomes, including the ones that complete a reconnect.
#[async_trait]
pub trait SessionWelcomeHandler: Send + Sync + fmt::Debug {
    /// Called with the new session id once the session is live.
    async fn handle_session_welcome(&self, session_id: &str) -> HandlerResult<()>;
}

/// Receives the end of a session.
#[async_trait]
pub trait DisconnectHandler: Send + Sync + fmt::Debug {
    /// Called once when the session stops, whether requested or not.
    async fn handle_disconnected(&self, reason: &DisconnectReason) -> HandlerResult<()>;
}

/// Receives subscription revocations.
#[async_trait]
pub trait RevocationHandler: Send + Sync + fmt::Debug {
    /// Called when the server revokes a subscription.
    async fn handle_revocation(&self, subscription_id: &str, status: &str) -> HandlerResult<()>;
}

/// Closure adapter for [`NotificationHandler`]
pub struct NotificationFn<F>(pub F);

/// Closure adapter for [`SessionWelcomeHandler`]
pub struct WelcomeFn<F>(pub F);

/// Closure adapter for [`DisconnectHandler`]
pub struct DisconnectFn<F>(pub F);

/// Closure adapter for [`RevocationHandler`]
pub struct RevocationFn<F>(pub F);

macro_rules! opaque_debug {
    ($($name:ident),*) => {
        $(impl<F> fmt::Debug for $name<F> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        })*
    };
}

opaque_debug!(NotificationFn, WelcomeFn, DisconnectFn, RevocationFn);

#[async_trait]
impl<F, Fut> NotificationHandler for NotificationFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn handle_notification(&self, notification: &Envelope) -> HandlerResult<()> {
        (self.0)(notification.clone()).await
    }
}

#[async_trait]
impl<F, Fut> SessionWelcomeHandler for WelcomeFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn handle_session_welcome(&self, session_id: &str) -> HandlerResult<()> {
        (self.0)(session_id.to_string()).await
    }
}

#[async_trait]
impl<F, Fut> DisconnectHandler for DisconnectFn<F>
where
    F: Fn(DisconnectReason) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn handle_disconnected(&self, reason: &DisconnectReason) -> HandlerResult<()> {
        (self.0)(reason.clone()).await
    }
}

#[async_trait]
impl<F, Fut> RevocationHandler for RevocationFn<F>
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn handle_revocation(&self, subscription_id: &str, status: &str) -> HandlerResult<()> {
        (self.0)(subscription_id.to_string(), status.to_string()).await
    }
}

/// Registered handlers, per kind, in registration order.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    notification: Vec<Arc<dyn NotificationHandler>>,
    welcome: Vec<Arc<dyn SessionWelcomeHandler>>,
    disconnect: Vec<Arc<dyn DisconnectHandler>>,
    revocation: Vec<Arc<dyn RevocationHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty handler registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification handler
    pub fn add_notification_handler(&mut self, handler: Arc<dyn NotificationHandler>) {
        debug!("Registering notification handler #{}", self.notification.len());
        self.notification.push(handler);
    }

    /// Register a welcome handler
    pub fn add_welcome_handler(&mut self, handler: Arc<dyn SessionWelcomeHandler>) {
        debug!("Registering session welcome handler #{}", self.welcome.len());
        self.welcome.push(handler);
    }

    /// Register a disconnect handler
    pub fn add_disconnect_handler(&mut self, handler: Arc<dyn DisconnectHandler>) {
        debug!("Registering disconnect handler #{}", self.disconnect.len());
        self.disconnect.push(handler);
    }

    /// Register a revocation handler
    pub fn add_revocation_handler(&mut self, handler: Arc<dyn RevocationHandler>) {
        debug!("Registering revocation handler #{}", self.revocation.len());
        self.revocation.push(handler);
    }

    /// Number of handlers of every kind
    pub fn len(&self) -> usize {
        self.notification.len() + self.welcome.len() + self.disconnect.len() + self.revocation.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every notification handler; returns how many failed.
    pub async fn dispatch_notification(&self, notification: &Envelope) -> u64 {
        let mut failures = 0;
        for (index, handler) in self.notification.iter().enumerate() {
            if !invoke("notification", index, handler.handle_notification(notification)).await {
                failures += 1;
            }
        }
        failures
    }

    /// Run every welcome handler; returns how many failed.
    pub async fn dispatch_welcome(&self, session_id: &str) -> u64 {
        let mut failures = 0;
        for (index, handler) in self.welcome.iter().enumerate() {
            if !invoke("session welcome", index, handler.handle_session_welcome(session_id)).await {
                failures += 1;
            }
        }
        failures
    }

    /// Run every disconnect handler; returns how many failed.
    pub async fn dispatch_disconnected(&self, reason: &DisconnectReason) -> u64 {
        let mut failures = 0;
        for (index, handler) in self.disconnect.iter().enumerate() {
            if !invoke("disconnect", index, handler.handle_disconnected(reason)).await {
                failures += 1;
            }
        }
        failures
    }

    /// Run every revocation handler; returns how many failed.
    pub async fn dispatch_revocation(&self, subscription_id: &str, status: &str) -> u64 {
        let mut failures = 0;
        for (index, handler) in self.revocation.iter().enumerate() {
            if !invoke("revocation", index, handler.handle_revocation(subscription_id, status)).await {
                failures += 1;
            }
        }
        failures
    }
}

/// Await one handler, containing both errors and panics.
async fn invoke<Fut>(kind: &str, index: usize, call: Fut) -> bool
where
    Fut: Future<Output = HandlerResult<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("{} handler #{} failed: {}", kind, index, e);
            false
        }
        Err(panic) => {
            error!("{} handler #{} panicked: {}", kind, index, panic_message(&*panic));
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
