//! IPC bridge for Officevisor
//!
//! A converter process exposes its remote API over a single point-to-point
//! bridge. This crate defines the bridge seam ([`Bridge`],
//! [`BridgeConnector`]), a TCP implementation of it, and the
//! [`Connection`] that establishes bridges, detects their disposal and
//! notifies [`ConnectionListener`]s.

pub mod connection;
pub mod error;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use connection::{Connection, ConnectionEvent, ConnectionListener};
pub use error::{BridgeError, BridgeResult};
pub use protocol::{
    BridgeReply, BridgeRequest, MessageEnvelope, RemoteError, RemoteErrorKind, RemoteService,
    BRIDGE_PROTOCOL_VERSION, DESKTOP_SERVICE,
};
pub use transport::{Bridge, BridgeConnector, DisposeCallback, TcpBridge, TcpBridgeConnector};
