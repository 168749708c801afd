//! Stream error types.

use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A specialized `Result` type for stream operations.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Represents errors that can occur while opening, reading or closing a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamError {
    /// The URL is not a usable stream endpoint.
    #[error("Invalid stream URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection establishment timed out.
    #[error(
        "Connection to {url} timed out after {timeout:?}. \
         If this is expected, increase the timeout with \
         `WebSocketConfig::with_connect_timeout(Duration::from_secs({}))`",
        timeout.as_secs() * 2
    )]
    ConnectionTimeout {
        /// The endpoint that did not answer
        url: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to receive a frame.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame size exceeds the configured maximum.
    #[error("Frame size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    FrameTooLarge {
        /// The actual size of the frame in bytes
        size: usize,
        /// The maximum allowed size in bytes
        max: usize,
    },

    /// The stream was already closed.
    #[error("Stream closed")]
    Closed,

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl StreamError {
    /// Returns `true` when retrying the same operation later could succeed.
    ///
    /// Invalid URLs never get better by waiting; everything else is a
    /// network condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidUrl { .. })
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tungstenite::Error> for StreamError {
    fn from(err: tungstenite::Error) -> Self {
        use tungstenite::error::CapacityError;

        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            tungstenite::Error::Io(e) => Self::Io(e.to_string()),
            tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                Self::FrameTooLarge {
                    size,
                    max: max_size,
                }
            }
            tungstenite::Error::Url(e) => Self::InvalidUrl {
                url: String::new(),
                reason: e.to_string(),
            },
            tungstenite::Error::Protocol(e) => Self::ConnectionLost(e.to_string()),
            other => Self::ReceiveFailed(other.to_string()),
        }
    }
}
