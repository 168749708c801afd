//! Message classification.
//!
//! [`classify`] turns one raw frame into exactly one [`ClassifiedEvent`]. It is
//! pure and total: anything that cannot be understood becomes
//! [`ClassifiedEvent::Unknown`] with a reason, never an error or a panic.

use std::fmt;

use serde::Serialize;

use crate::envelope::Envelope;

/// Wire name of the welcome message.
pub const SESSION_WELCOME: &str = "session_welcome";
/// Wire name of the keepalive message.
pub const SESSION_KEEPALIVE: &str = "session_keepalive";
/// Wire name of the notification message.
pub const NOTIFICATION: &str = "notification";
/// Wire name of the reconnect message.
pub const RECONNECT: &str = "reconnect";
/// Long form of the reconnect message used by the upstream platform.
pub const SESSION_RECONNECT: &str = "session_reconnect";
/// Wire name of the revocation message.
pub const REVOCATION: &str = "revocation";

/// Why a frame classified as [`ClassifiedEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnknownReason {
    /// Not UTF-8 JSON at all
    DecodeError,
    /// JSON, but not an envelope (or `metadata.message_type` missing)
    Malformed,
    /// A well-formed envelope with a message type outside the known set
    UnrecognizedType(String),
}

impl fmt::Display for UnknownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodeError => write!(f, "decode-error"),
            Self::Malformed => write!(f, "malformed"),
            Self::UnrecognizedType(value) => write!(f, "unrecognized-type:{value}"),
        }
    }
}

/// The typed meaning of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    /// A new session is established on this stream.
    SessionWelcome {
        /// Session id; empty when the server omitted it
        session_id: String,
        /// Advertised keepalive interval
        keepalive_timeout_seconds: Option<u64>,
    },

    /// Liveness-only frame.
    SessionKeepalive,

    /// A subscription event.
    Notification {
        /// The full envelope, handed to notification handlers
        envelope: Box<Envelope>,
    },

    /// The server asks the client to move to another stream.
    Reconnect {
        /// Where to go; `None` means the configured default endpoint
        reconnect_url: Option<String>,
        /// Always `true`: the old stream must be torn down once the new one is live
        requires_disconnect: bool,
    },

    /// A subscription was invalidated. No effect on the connection.
    Revocation {
        /// The revoked subscription
        subscription_id: String,
        /// Revocation status, e.g. `authorization_revoked`
        status: String,
    },

    /// Anything that could not be classified.
    Unknown {
        /// Why
        reason: UnknownReason,
    },
}

impl ClassifiedEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionWelcome { .. } => SESSION_WELCOME,
            Self::SessionKeepalive => SESSION_KEEPALIVE,
            Self::Notification { .. } => NOTIFICATION,
            Self::Reconnect { .. } => RECONNECT,
            Self::Revocation { .. } => REVOCATION,
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Whether this event counts as proof of liveness. Everything but
    /// `Unknown` does.
    pub fn proves_liveness(&self) -> bool {
        !matches!(self, Self::Unknown { .. })
    }
}

/// Classifies a raw frame.
pub fn classify(raw: &[u8]) -> ClassifiedEvent {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(raw) else {
        return unknown(UnknownReason::DecodeError);
    };
    classify_value(value)
}

/// Classifies a text frame.
pub fn classify_str(raw: &str) -> ClassifiedEvent {
    classify(raw.as_bytes())
}

fn classify_value(value: serde_json::Value) -> ClassifiedEvent {
    let Ok(envelope) = serde_json::from_value::<Envelope>(value) else {
        return unknown(UnknownReason::Malformed);
    };

    let message_type = envelope.metadata.message_type.to_ascii_lowercase();
    match message_type.as_str() {
        SESSION_WELCOME => {
            let session = envelope.payload.session.as_ref();
            ClassifiedEvent::SessionWelcome {
                session_id: session
                    .and_then(|s| s.id())
                    .unwrap_or_default()
                    .to_string(),
                keepalive_timeout_seconds: session.and_then(|s| s.keepalive_timeout_seconds),
            }
        }
        SESSION_KEEPALIVE => ClassifiedEvent::SessionKeepalive,
        NOTIFICATION => ClassifiedEvent::Notification {
            envelope: Box::new(envelope),
        },
        RECONNECT | SESSION_RECONNECT => ClassifiedEvent::Reconnect {
            reconnect_url: envelope
                .payload
                .session
                .as_ref()
                .and_then(|s| s.reconnect_url())
                .map(str::to_string),
            requires_disconnect: true,
        },
        REVOCATION => {
            let subscription = envelope.payload.subscription.as_ref();
            ClassifiedEvent::Revocation {
                subscription_id: subscription
                    .and_then(|s| s.id())
                    .unwrap_or_default()
                    .to_string(),
                status: subscription
                    .and_then(|s| s.status())
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        _ => unknown(UnknownReason::UnrecognizedType(
            envelope.metadata.message_type,
        )),
    }
}

fn unknown(reason: UnknownReason) -> ClassifiedEvent {
    ClassifiedEvent::Unknown { reason }
}
