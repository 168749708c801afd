//! Core stream traits.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StreamResult;

/// One complete inbound message as delivered by the stream.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Wraps a payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Builds a frame from a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as UTF-8, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consumes the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) if text.len() <= 128 => f.debug_tuple("Frame").field(&text).finish(),
            _ => f
                .debug_struct("Frame")
                .field("len", &self.payload.len())
                .finish(),
        }
    }
}

/// A persistent, read-oriented message stream.
///
/// A stream is owned by exactly one reader at a time. `read_frame` suspends
/// until the next complete frame arrives. Dropping the future (for example
/// from a `tokio::select!` branch) loses no data frame, but an implementation
/// that answers control frames while reading may be interrupted mid-answer:
/// the WebSocket stream can drop or delay the pong for a ping it was replying
/// to.
#[async_trait]
pub trait FrameStream: Send + fmt::Debug {
    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the remote side closed the stream cleanly.
    async fn read_frame(&mut self) -> StreamResult<Option<Frame>>;

    /// Closes the stream. Closing an already closed stream succeeds.
    async fn close(&mut self) -> StreamResult<()>;

    /// The URL this stream was opened against.
    fn url(&self) -> &str;
}

/// Opens [`FrameStream`]s.
#[async_trait]
pub trait StreamConnector: Send + Sync + fmt::Debug {
    /// Opens a new stream to `url`.
    async fn open_stream(&self, url: &str) -> StreamResult<Box<dyn FrameStream>>;
}

#[async_trait]
impl<C> StreamConnector for std::sync::Arc<C>
where
    C: StreamConnector + ?Sized,
{
    async fn open_stream(&self, url: &str) -> StreamResult<Box<dyn FrameStream>> {
        (**self).open_stream(url).await
    }
}
