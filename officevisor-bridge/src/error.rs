//! Bridge error types

use officevisor_resilience::Retryable;
use thiserror::Error;

use crate::protocol::{RemoteError, RemoteErrorKind};

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Nothing listens on the endpoint (yet)
    #[error("Connection refused by {address}")]
    ConnectRefused {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint was reached but the bridge could not be set up
    #[error("Failed to establish bridge to {address}: {message}")]
    Connection { address: String, message: String },

    /// A named service could not be resolved
    #[error("Service lookup failed for {service}: {source}")]
    ServiceLookup {
        service: String,
        #[source]
        source: Box<BridgeError>,
    },

    /// The bridge went away while or before the call was made
    #[error("Bridge disposed")]
    Disposed,

    /// No bridge is currently established
    #[error("Not connected")]
    NotConnected,

    /// The remote side rejected a call
    #[error("Remote call failed ({kind}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// The peer answered with something that makes no sense here
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl BridgeError {
    /// Whether the error means the remote end is already gone
    pub fn is_disposed(&self) -> bool {
        match self {
            BridgeError::Disposed => true,
            BridgeError::Remote { kind, .. } => *kind == RemoteErrorKind::Disposed,
            BridgeError::ServiceLookup { source, .. } => source.is_disposed(),
            _ => false,
        }
    }

    pub fn is_connect_refused(&self) -> bool {
        matches!(self, BridgeError::ConnectRefused { .. })
    }
}

impl Retryable for BridgeError {
    fn is_retryable(&self) -> bool {
        self.is_connect_refused()
    }
}

impl From<RemoteError> for BridgeError {
    fn from(error: RemoteError) -> Self {
        match error.kind {
            RemoteErrorKind::Disposed => BridgeError::Disposed,
            kind => BridgeError::Remote {
                kind,
                message: error.message,
            },
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> BridgeError {
        BridgeError::ConnectRefused {
            address: "127.0.0.1:2002".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        }
    }

    #[test]
    fn test_only_refusal_is_retryable() {
        assert!(refused().is_retryable());
        assert!(!BridgeError::Disposed.is_retryable());
        assert!(!BridgeError::Connection {
            address: "127.0.0.1:2002".to_string(),
            message: "handshake failed".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_disposed_detection_looks_through_lookup() {
        let lookup = BridgeError::ServiceLookup {
            service: "com.sun.star.frame.Desktop".to_string(),
            source: Box::new(BridgeError::Disposed),
        };
        assert!(lookup.is_disposed());

        let remote: BridgeError = RemoteError::new(RemoteErrorKind::Disposed, "gone").into();
        assert!(matches!(remote, BridgeError::Disposed));

        let failed: BridgeError = RemoteError::new(RemoteErrorKind::Failed, "nope").into();
        assert!(!failed.is_disposed());
    }
}
