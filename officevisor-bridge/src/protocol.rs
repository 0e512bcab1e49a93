//! Bridge wire protocol
//!
//! Every message travels as one line of JSON wrapped in a
//! [`MessageEnvelope`]. Requests and replies are paired through the
//! envelope's correlation id; replies may arrive in any order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Bridge protocol version for compatibility checking
pub const BRIDGE_PROTOCOL_VERSION: u32 = 1;

/// Desktop service through which a converter is asked to terminate
pub const DESKTOP_SERVICE: &str = "com.sun.star.frame.Desktop";

/// Messages sent from the supervisor side to the converter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// First message on a fresh socket; names the bridge
    Hello { bridge_name: String },

    /// Resolve a named remote service
    GetService { name: String },

    /// Call a method on a previously resolved service
    Invoke {
        handle: String,
        method: String,
        args: JsonValue,
    },

    /// Tear the bridge down
    Dispose,
}

/// Messages sent from the converter back over the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeReply {
    /// A service was resolved
    Service { handle: String },

    /// Return value of a request
    Value { value: JsonValue },

    /// The remote side rejected the request
    Error { error: RemoteError },
}

/// Error reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Classes of remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The remote object is already gone
    Disposed,
    /// No service registered under that name
    UnknownService,
    /// No such method on the service
    UnknownMethod,
    /// The call itself failed
    Failed,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            RemoteErrorKind::Disposed => "disposed",
            RemoteErrorKind::UnknownService => "unknown_service",
            RemoteErrorKind::UnknownMethod => "unknown_method",
            RemoteErrorKind::Failed => "failed",
        };
        f.write_str(kind)
    }
}

/// Handle of a remote service resolved over a bridge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteService {
    pub name: String,
    pub handle: String,
}

/// Message envelope for all bridge communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope with a fresh correlation id
    pub fn new(message: T) -> Self {
        Self::reply_to(Uuid::new_v4(), message)
    }

    /// Create an envelope answering the request with `correlation_id`
    pub fn reply_to(correlation_id: Uuid, message: T) -> Self {
        Self {
            protocol_version: BRIDGE_PROTOCOL_VERSION,
            correlation_id,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == BRIDGE_PROTOCOL_VERSION
    }
}
