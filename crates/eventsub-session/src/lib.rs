//! # EventSub Session
//!
//! Client side of an event-subscription session: a persistent streaming
//! connection to an event platform that announces itself with a welcome,
//! proves liveness with keepalives, pushes notifications and revocations, and
//! occasionally asks the client to move to another stream.
//!
//! ## Overview
//!
//! - **Classifier**: [`classify`] turns a raw frame into a [`ClassifiedEvent`]
//! - **State machine**: [`SessionMachine`] decides what every input means,
//!   without doing any I/O
//! - **Client**: [`SessionClient`] runs the machine on a driver task, one
//!   reader task per stream, and calls your handlers
//! - **Configuration**: [`SessionConfig`], [`ReconnectConfig`], [`DedupConfig`]
//! - **Observability**: `tracing` logs, [`SessionEvent`] broadcasts,
//!   [`SessionMetricsSnapshot`] counters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use eventsub_session::{SessionClient, SessionConfig};
//!
//! # async fn example() -> eventsub_session::SessionResult<()> {
//! let client = SessionClient::with_websocket(SessionConfig::default());
//!
//! client.on_session_welcome(|session_id| async move {
//!     println!("subscribe with session {session_id}");
//!     Ok(())
//! });
//! client.on_notification(|notification| async move {
//!     println!("{:?}", notification.payload.event);
//!     Ok(())
//! });
//!
//! client.connect().await?;
//! tokio::signal::ctrl_c().await.ok();
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reconnects
//!
//! A server-directed reconnect opens the new stream while the old one keeps
//! delivering. Only when the new stream's welcome arrives is the old stream
//! closed (and its reader joined), after which the new session id reaches the
//! welcome handlers. A lost connection (keepalive silence, read failure,
//! remote close) reconnects from scratch against the configured endpoint with
//! exponential backoff, and gives up after `reconnect.max_retries` consecutive
//! failures.
//!
//! ## Architecture
//!
//! ```text
//! eventsub-session/
//! ├── envelope.rs    # wire envelope types
//! ├── classifier.rs  # frame -> ClassifiedEvent
//! ├── state.rs       # SessionMachine, Input, Effect
//! ├── config.rs      # SessionConfig and file loading
//! ├── handlers.rs    # handler traits and registry
//! ├── dedup.rs       # notification deduplication
//! ├── events.rs      # lifecycle event broadcast
//! ├── metrics.rs     # atomic counters
//! ├── tasks.rs       # driver and reader tasks
//! └── client.rs      # SessionClient
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod classifier;
mod client;
pub mod config;
mod dedup;
mod envelope;
mod error;
mod events;
pub mod handlers;
mod metrics;
pub mod state;
mod tasks;

pub use classifier::{ClassifiedEvent, UnknownReason, classify, classify_str};
pub use client::SessionClient;
pub use config::{DEFAULT_ENDPOINT, DedupConfig, ReconnectConfig, SessionConfig};
pub use dedup::DeduplicationCache;
pub use envelope::{Envelope, Metadata, Payload, SessionPayload, SubscriptionPayload};
pub use error::{ConfigError, SessionError, SessionResult};
pub use events::{SessionEvent, SessionEventEmitter};
pub use handlers::{
    DisconnectHandler, HandlerError, HandlerRegistry, HandlerResult, NotificationHandler,
    RevocationHandler, SessionWelcomeHandler,
};
pub use metrics::{SessionMetrics, SessionMetricsSnapshot};
pub use state::{DisconnectReason, Effect, Input, SessionMachine, SessionPhase, SessionState};

/// Re-export of the transport crate
pub use eventsub_transport as transport;
