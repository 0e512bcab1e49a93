//! Bridge transport implementations

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use officevisor_config::EndpointAddress;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{BridgeReply, BridgeRequest, MessageEnvelope, RemoteService};

/// Invoked once when a bridge goes away, for whatever reason
pub type DisposeCallback = Arc<dyn Fn() + Send + Sync>;

/// A point-to-point bridge to one converter process
#[async_trait]
pub trait Bridge: Send + Sync + fmt::Debug {
    /// Unique name this bridge was created with
    fn name(&self) -> &str;

    /// Resolve a named remote service
    async fn get_service(&self, name: &str) -> BridgeResult<RemoteService>;

    /// Call `method` on a resolved service
    async fn invoke(
        &self,
        service: &RemoteService,
        method: &str,
        args: JsonValue,
    ) -> BridgeResult<JsonValue>;

    /// Register a disposal callback.
    ///
    /// A callback registered on an already disposed bridge runs immediately.
    fn on_disposed(&self, callback: DisposeCallback);

    /// Tear the bridge down and fire the disposal callbacks
    async fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Creates bridges to an endpoint
#[async_trait]
pub trait BridgeConnector: Send + Sync + fmt::Debug {
    /// Open a new bridge named `bridge_name`.
    ///
    /// Fails with [`BridgeError::ConnectRefused`] when nothing listens on the
    /// endpoint, and with [`BridgeError::Connection`] for anything else.
    async fn connect(
        &self,
        endpoint: &EndpointAddress,
        bridge_name: &str,
    ) -> BridgeResult<Arc<dyn Bridge>>;
}

/// Connects [`TcpBridge`]s
#[derive(Debug, Clone)]
pub struct TcpBridgeConnector {
    handshake_timeout: Duration,
}

impl TcpBridgeConnector {
    pub fn new() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for TcpBridgeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BridgeConnector for TcpBridgeConnector {
    async fn connect(
        &self,
        endpoint: &EndpointAddress,
        bridge_name: &str,
    ) -> BridgeResult<Arc<dyn Bridge>> {
        let address = endpoint.socket_address();

        let stream = TcpStream::connect(&address).await.map_err(|source| {
            match source.kind() {
                // The process is up but not listening yet, or just went away
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted => BridgeError::ConnectRefused {
                    address: address.clone(),
                    source,
                },
                _ => BridgeError::Connection {
                    address: address.clone(),
                    message: source.to_string(),
                },
            }
        })?;

        stream
            .set_nodelay(true)
            .map_err(|e| BridgeError::Connection {
                address: address.clone(),
                message: format!("Failed to enable TCP_NODELAY: {}", e),
            })?;

        let bridge = TcpBridge::open(stream, bridge_name);
        let hello = BridgeRequest::Hello {
            bridge_name: bridge_name.to_string(),
        };

        match tokio::time::timeout(self.handshake_timeout, bridge.call(hello)).await {
            Ok(Ok(_)) => {
                debug!(bridge = %bridge_name, %address, "Bridge established");
                Ok(bridge as Arc<dyn Bridge>)
            }
            // Closed before the handshake completed: still coming up
            Ok(Err(e)) if e.is_disposed() => {
                bridge.dispose().await;
                Err(BridgeError::ConnectRefused {
                    address,
                    source: std::io::Error::new(
                        ErrorKind::ConnectionReset,
                        "bridge closed during handshake",
                    ),
                })
            }
            Ok(Err(e)) => {
                bridge.dispose().await;
                Err(BridgeError::Connection {
                    address,
                    message: format!("Handshake failed: {}", e),
                })
            }
            Err(_) => {
                bridge.dispose().await;
                Err(BridgeError::Connection {
                    address,
                    message: format!("Handshake timed out after {:?}", self.handshake_timeout),
                })
            }
        }
    }
}

type PendingCalls = Mutex<HashMap<Uuid, oneshot::Sender<BridgeReply>>>;

/// Runs the disposal callbacks exactly once
#[derive(Default)]
struct Disposal {
    state: Mutex<DisposalState>,
}

#[derive(Default)]
struct DisposalState {
    disposed: bool,
    callbacks: Vec<DisposeCallback>,
}

impl Disposal {
    fn register(&self, callback: DisposeCallback) {
        let already_disposed = {
            let mut state = self.state.lock();
            if !state.disposed {
                state.callbacks.push(callback.clone());
            }
            state.disposed
        };

        if already_disposed {
            callback();
        }
    }

    fn fire(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.callbacks)
        };

        for callback in callbacks {
            callback();
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

/// Bridge speaking newline-delimited JSON envelopes over a TCP socket.
///
/// A background reader resolves pending calls by correlation id. EOF, a
/// read error or [`Bridge::dispose`] disposes the bridge; callbacks fire
/// once, before pending calls are failed with [`BridgeError::Disposed`].
pub struct TcpBridge {
    name: String,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<PendingCalls>,
    disposal: Arc<Disposal>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpBridge {
    /// Wrap a connected stream and start its reader
    pub fn open(stream: TcpStream, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<PendingCalls> = Arc::new(Mutex::new(HashMap::new()));
        let disposal = Arc::new(Disposal::default());

        let reader = tokio::spawn(read_replies(
            name.clone(),
            read_half,
            pending.clone(),
            disposal.clone(),
        ));

        Arc::new(Self {
            name,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            disposal,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn send(&self, envelope: &MessageEnvelope<BridgeRequest>) -> BridgeResult<()> {
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(BridgeError::Disposed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a request and wait for its reply
    async fn call(&self, request: BridgeRequest) -> BridgeResult<BridgeReply> {
        if self.disposal.is_disposed() {
            return Err(BridgeError::Disposed);
        }

        let envelope = MessageEnvelope::new(request);
        let correlation_id = envelope.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        // The reader marks the bridge disposed before it drops pending calls
        if self.disposal.is_disposed() {
            self.pending.lock().remove(&correlation_id);
            return Err(BridgeError::Disposed);
        }

        if let Err(e) = self.send(&envelope).await {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match rx.await {
            Ok(BridgeReply::Error { error }) => Err(error.into()),
            Ok(reply) => Ok(reply),
            Err(_) => Err(BridgeError::Disposed),
        }
    }
}

impl fmt::Debug for TcpBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpBridge")
            .field("name", &self.name)
            .field("disposed", &self.disposal.is_disposed())
            .finish()
    }
}

#[async_trait]
impl Bridge for TcpBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_service(&self, name: &str) -> BridgeResult<RemoteService> {
        let reply = self
            .call(BridgeRequest::GetService {
                name: name.to_string(),
            })
            .await?;

        match reply {
            BridgeReply::Service { handle } => Ok(RemoteService {
                name: name.to_string(),
                handle,
            }),
            other => Err(BridgeError::InvalidMessage(format!(
                "Expected a service handle for {}, got {:?}",
                name, other
            ))),
        }
    }

    async fn invoke(
        &self,
        service: &RemoteService,
        method: &str,
        args: JsonValue,
    ) -> BridgeResult<JsonValue> {
        let reply = self
            .call(BridgeRequest::Invoke {
                handle: service.handle.clone(),
                method: method.to_string(),
                args,
            })
            .await?;

        match reply {
            BridgeReply::Value { value } => Ok(value),
            other => Err(BridgeError::InvalidMessage(format!(
                "Expected a value from {}.{}, got {:?}",
                service.name, method, other
            ))),
        }
    }

    fn on_disposed(&self, callback: DisposeCallback) {
        self.disposal.register(callback);
    }

    async fn dispose(&self) {
        if !self.disposal.is_disposed() {
            // Best effort; the peer may already be gone
            let goodbye = MessageEnvelope::new(BridgeRequest::Dispose);
            if let Err(e) = self.send(&goodbye).await {
                trace!(bridge = %self.name, "Dispose notice not delivered: {}", e);
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        self.disposal.fire();
        self.pending.lock().clear();
    }

    fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }
}

impl Drop for TcpBridge {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_replies(
    name: String,
    read_half: OwnedReadHalf,
    pending: Arc<PendingCalls>,
    disposal: Arc<Disposal>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }

                let envelope: MessageEnvelope<BridgeReply> = match serde_json::from_str(&line) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(bridge = %name, "Discarding malformed reply: {}", e);
                        continue;
                    }
                };

                if !envelope.is_compatible() {
                    warn!(
                        bridge = %name,
                        version = envelope.protocol_version,
                        "Peer speaks an incompatible protocol version"
                    );
                    break;
                }

                let waiter = pending.lock().remove(&envelope.correlation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope.message);
                    }
                    None => trace!(
                        bridge = %name,
                        correlation_id = %envelope.correlation_id,
                        "Reply without a pending call"
                    ),
                }
            }
            Ok(None) => {
                debug!(bridge = %name, "Bridge closed by peer");
                break;
            }
            Err(e) => {
                debug!(bridge = %name, "Bridge read failed: {}", e);
                break;
            }
        }
    }

    disposal.fire();
    pending.lock().clear();
}
