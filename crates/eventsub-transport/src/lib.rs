//! # EventSub Transport
//!
//! The frame stream primitive used by the event-subscription session client.
//! A session needs very little from its transport: open a persistent stream to
//! a URL, read whole frames from it one at a time, and close it. This crate
//! defines that contract and ships the production implementation on top of
//! `tokio-tungstenite`.
//!
//! ## Overview
//!
//! - **Traits**: [`StreamConnector`] opens streams, [`FrameStream`] reads and closes them
//! - **Types**: [`Frame`]
//! - **Errors**: [`StreamError`], [`StreamResult`]
//! - **WebSocket**: [`WebSocketConnector`], [`WebSocketConfig`]
//! - **In-memory** (feature `memory`): [`memory::MemoryConnector`] for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use eventsub_transport::{StreamConnector, WebSocketConnector};
//!
//! # async fn example() -> eventsub_transport::StreamResult<()> {
//! let connector = WebSocketConnector::default();
//! let mut stream = connector.open_stream("wss://eventsub.wss.twitch.tv/ws").await?;
//! while let Some(frame) = stream.read_frame().await? {
//!     println!("{}", frame.as_text().unwrap_or("<binary>"));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! eventsub-transport/
//! ├── error.rs      # StreamError and conversions
//! ├── traits.rs     # Frame, FrameStream, StreamConnector
//! ├── websocket.rs  # tokio-tungstenite connector
//! └── memory.rs     # in-memory connector (feature = "memory")
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

mod error;
mod traits;
mod websocket;

#[cfg(feature = "memory")]
#[cfg_attr(docsrs, doc(cfg(feature = "memory")))]
pub mod memory;

pub use error::{StreamError, StreamResult};
pub use traits::{Frame, FrameStream, StreamConnector};
pub use websocket::{WebSocketConfig, WebSocketConnector, WebSocketFrameStream, validate_stream_url};
