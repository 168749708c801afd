//! WebSocket connector built on `tokio-tungstenite`.
//!
//! Control frames are handled here so sessions only ever see data frames:
//! pings are answered with pongs, pongs are swallowed, and a close frame ends
//! the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{StreamError, StreamResult};
use crate::traits::{Frame, FrameStream, StreamConnector};

/// Underlying socket type produced by `connect_async`.
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for [`WebSocketConnector`].
#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// Upper bound for the TCP + TLS + upgrade handshake
    pub connect_timeout: Duration,

    /// Maximum size of a single inbound message (default: 1MiB)
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
        }
    }
}

impl WebSocketConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

/// Checks that `url` is an absolute `ws://` or `wss://` URL with a host.
pub fn validate_stream_url(url: &str) -> StreamResult<Url> {
    let parsed = Url::parse(url).map_err(|e| StreamError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(StreamError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}', expected ws or wss", parsed.scheme()),
        });
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(StreamError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(parsed)
}

/// Opens WebSocket streams.
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector with the given configuration
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// The connector's configuration
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_message_size))
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn open_stream(&self, url: &str) -> StreamResult<Box<dyn FrameStream>> {
        let parsed = validate_stream_url(url)?;
        debug!("Connecting to WebSocket endpoint {}", parsed);

        let handshake =
            connect_async_with_config(parsed.as_str(), Some(self.protocol_config()), true);

        let (socket, response) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| StreamError::ConnectionTimeout {
                url: url.to_string(),
                timeout: self.config.connect_timeout,
            })?
            .map_err(|e| {
                StreamError::ConnectionFailed(format!("WebSocket connection failed: {}", e))
            })?;

        info!(
            "WebSocket connected to {} (status {})",
            parsed,
            response.status()
        );

        Ok(Box::new(WebSocketFrameStream {
            socket: Some(socket),
            url: url.to_string(),
        }))
    }
}

/// A [`FrameStream`] over a client WebSocket.
///
/// Pings are answered from inside [`read_frame`](FrameStream::read_frame), so
/// a read cancelled while a pong is being written may leave that ping
/// unanswered.
#[derive(Debug)]
pub struct WebSocketFrameStream {
    socket: Option<Socket>,
    url: String,
}

#[async_trait]
impl FrameStream for WebSocketFrameStream {
    async fn read_frame(&mut self) -> StreamResult<Option<Frame>> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(StreamError::Closed);
        };

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Frame::new(data)));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        warn!("Failed to answer ping on {}: {}", self.url, e);
                        return Err(e.into());
                    }
                    trace!("Answered ping on {}", self.url);
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!("Received pong on {}", self.url);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("WebSocket {} closed by peer: {:?}", self.url, frame);
                    self.socket = None;
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {
                    trace!("Ignoring raw frame on {}", self.url);
                }
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(e.into());
                }
                None => {
                    debug!("WebSocket stream {} ended", self.url);
                    self.socket = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        if let Some(mut socket) = self.socket.take() {
            match socket.close(None).await {
                Ok(()) => debug!("WebSocket {} closed", self.url),
                Err(e) => trace!("Close handshake on {} did not complete: {}", self.url, e),
            }
        }
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_websocket_config_builder() {
        let config = WebSocketConfig::new()
            .with_connect_timeout(Duration::from_secs(3))
            .with_max_message_size(4096);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.max_message_size, 4096);
    }

    #[test]
    fn test_validate_stream_url() {
        assert!(validate_stream_url("wss://eventsub.wss.twitch.tv/ws").is_ok());
        assert!(validate_stream_url("ws://127.0.0.1:8080").is_ok());

        let err = validate_stream_url("https://example.com").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));

        assert!(matches!(
            validate_stream_url("not a url"),
            Err(StreamError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url_without_network() {
        let connector = WebSocketConnector::default();
        let result = connector.open_stream("ftp://example.com").await;
        assert!(matches!(result, Err(StreamError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector =
            WebSocketConnector::new(WebSocketConfig::new().with_connect_timeout(Duration::from_secs(2)));
        // Port 1 is essentially never listening
        let result = connector.open_stream("ws://127.0.0.1:1").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_retryable());
    }
}
