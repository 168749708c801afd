//! Wire envelope types.
//!
//! Every inbound frame is a JSON object with a `metadata` block naming the
//! message type and a `payload` whose shape depends on that type. Only
//! `metadata.message_type` is mandatory; everything else is optional so that
//! a frame missing an unrelated field still classifies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message metadata
    pub metadata: Metadata,

    /// Type-dependent payload
    #[serde(default)]
    pub payload: Payload,
}

/// Envelope metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Message type, e.g. `session_welcome`
    pub message_type: String,

    /// Unique message id; repeats on redelivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Send time as RFC 3339 text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<String>,

    /// Subscription type, notifications and revocations only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,

    /// Subscription version, notifications and revocations only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_version: Option<String>,
}

impl Metadata {
    /// The message id, with empty ids treated as absent.
    pub fn message_id(&self) -> Option<&str> {
        non_empty(self.message_id.as_deref())
    }

    /// Parsed send time. `None` when absent or not RFC 3339.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = non_empty(self.message_timestamp.as_deref())?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Envelope payload. At most one of `session` / `subscription` is normally set,
/// `event` accompanies notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Session block (welcome, reconnect)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionPayload>,

    /// Subscription block (notification, revocation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionPayload>,

    /// Event body, opaque to the session layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<serde_json::Value>,
}

/// Session block of a welcome or reconnect message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    /// Session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Session status, e.g. `connected` or `reconnecting`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Maximum silence the server allows before the client should assume loss
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_timeout_seconds: Option<u64>,

    /// Where to reconnect to (reconnect messages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_url: Option<String>,

    /// Connection time as RFC 3339 text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

impl SessionPayload {
    /// Session id, empty treated as absent.
    pub fn id(&self) -> Option<&str> {
        non_empty(self.id.as_deref())
    }

    /// Reconnect URL, empty treated as absent.
    pub fn reconnect_url(&self) -> Option<&str> {
        non_empty(self.reconnect_url.as_deref())
    }
}

/// Subscription block of a notification or revocation message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    /// Subscription id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Subscription status, e.g. `enabled` or `authorization_revoked`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Subscription type, e.g. `channel.follow`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Subscription version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Subscription condition, opaque
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,

    /// Creation time as RFC 3339 text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl SubscriptionPayload {
    /// Subscription id, empty treated as absent.
    pub fn id(&self) -> Option<&str> {
        non_empty(self.id.as_deref())
    }

    /// Subscription status, empty treated as absent.
    pub fn status(&self) -> Option<&str> {
        non_empty(self.status.as_deref())
    }

    /// Subscription type, empty treated as absent.
    pub fn kind(&self) -> Option<&str> {
        non_empty(self.kind.as_deref())
    }
}

impl Envelope {
    /// Subscription type from the subscription block, falling back to metadata.
    pub fn subscription_type(&self) -> Option<&str> {
        self.payload
            .subscription
            .as_ref()
            .and_then(SubscriptionPayload::kind)
            .or_else(|| non_empty(self.metadata.subscription_type.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
