//! In-memory connector.
//!
//! Every stream opened through a [`MemoryConnector`] is paired with a
//! [`MemoryPeer`] that plays the server: it pushes frames, injects read
//! errors, ends the stream, and observes when the client closes it. Useful for
//! deterministic session tests and for embedding the session client in
//! environments without sockets.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::error::{StreamError, StreamResult};
use crate::traits::{Frame, FrameStream, StreamConnector};

#[derive(Debug)]
enum PeerMessage {
    Frame(Frame),
    Error(StreamError),
    End,
}

#[derive(Debug)]
struct ConnectorState {
    attempts: Vec<String>,
    failures: VecDeque<StreamError>,
}

/// Connector whose streams are driven by [`MemoryPeer`] handles.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    refuse_all: Arc<AtomicBool>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create a connector that accepts every connection
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                attempts: Vec::new(),
                failures: VecDeque::new(),
            })),
            refuse_all: Arc::new(AtomicBool::new(false)),
            peers_tx,
            peers_rx: Arc::new(AsyncMutex::new(peers_rx)),
        }
    }

    /// Make the next open attempt fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: StreamError) {
        self.state.lock().failures.push_back(error);
    }

    /// Refuse (or stop refusing) every open attempt.
    pub fn set_refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Every URL an open was attempted against, in order, failed ones included.
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }

    /// Waits for the next successfully opened stream and returns its peer.
    ///
    /// # Panics
    ///
    /// Never in practice: the connector keeps its own sender alive.
    pub async fn next_peer(&self) -> MemoryPeer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector holds a sender")
    }

    /// Returns an already opened peer without waiting.
    pub fn try_next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl StreamConnector for MemoryConnector {
    async fn open_stream(&self, url: &str) -> StreamResult<Box<dyn FrameStream>> {
        let planned_failure = {
            let mut state = self.state.lock();
            state.attempts.push(url.to_string());
            state.failures.pop_front()
        };

        if let Some(error) = planned_failure {
            return Err(error);
        }
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(StreamError::ConnectionFailed(format!(
                "connection to {} refused",
                url
            )));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let peer = MemoryPeer {
            url: url.to_string(),
            frames_tx,
            closed_rx,
        };
        let stream = MemoryStream {
            url: url.to_string(),
            frames_rx,
            closed_tx,
            ended: false,
        };

        let _ = self.peers_tx.send(peer);
        Ok(Box::new(stream))
    }
}

/// Server side of an in-memory stream.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    url: String,
    frames_tx: mpsc::UnboundedSender<PeerMessage>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryPeer {
    /// URL the client opened
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a text frame. Returns `false` once the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.frames_tx
            .send(PeerMessage::Frame(Frame::text(text)))
            .is_ok()
    }

    /// Push raw bytes.
    pub fn send_bytes(&self, bytes: impl Into<bytes::Bytes>) -> bool {
        self.frames_tx
            .send(PeerMessage::Frame(Frame::new(bytes)))
            .is_ok()
    }

    /// Make the client's next read fail.
    pub fn fail(&self, error: StreamError) -> bool {
        self.frames_tx.send(PeerMessage::Error(error)).is_ok()
    }

    /// End the stream as a clean remote close.
    pub fn end(&self) -> bool {
        self.frames_tx.send(PeerMessage::End).is_ok()
    }

    /// Whether the client closed (or dropped) its side.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || self.frames_tx.is_closed()
    }

    /// Waits until the client closes or drops its side.
    pub async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => {}
            () = self.frames_tx.closed() => {}
        }
    }
}

/// Client side of an in-memory stream.
#[derive(Debug)]
pub struct MemoryStream {
    url: String,
    frames_rx: mpsc::UnboundedReceiver<PeerMessage>,
    closed_tx: watch::Sender<bool>,
    ended: bool,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn read_frame(&mut self) -> StreamResult<Option<Frame>> {
        if *self.closed_tx.borrow() {
            return Err(StreamError::Closed);
        }
        if self.ended {
            return Ok(None);
        }

        match self.frames_rx.recv().await {
            Some(PeerMessage::Frame(frame)) => Ok(Some(frame)),
            Some(PeerMessage::Error(error)) => Err(error),
            Some(PeerMessage::End) | None => {
                self.ended = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.closed_tx.send_replace(true);
        self.frames_rx.close();
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.closed_tx.send_replace(true);
    }
}
