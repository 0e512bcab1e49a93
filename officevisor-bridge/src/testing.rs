//! Test doubles for the bridge
//!
//! [`FakeConnector`] hands out in-memory [`FakeBridge`]s; [`FakeConverter`]
//! is a real TCP peer speaking the bridge protocol. Enabled for this
//! crate's tests and, through the `testing` feature, for dependent crates.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use officevisor_config::{EndpointAddress, ROOT_OBJECT_NAME};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    BridgeReply, BridgeRequest, MessageEnvelope, RemoteError, RemoteErrorKind, RemoteService,
    DESKTOP_SERVICE,
};
use crate::transport::{Bridge, BridgeConnector, DisposeCallback};

#[derive(Debug, Default)]
struct HostState {
    listening: AtomicBool,
    terminate_calls: AtomicUsize,
}

/// Connector whose bridges live in memory.
///
/// Refuses connections until [`FakeConnector::set_listening`] is called,
/// like a converter that is still starting up.
#[derive(Debug, Default)]
pub struct FakeConnector {
    host: Arc<HostState>,
    connect_attempts: AtomicUsize,
    bridges: Mutex<Vec<Arc<FakeBridge>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_listening(&self, listening: bool) {
        self.host.listening.store(listening, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.host.listening.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// `terminate` calls received by any bridge
    pub fn terminate_calls(&self) -> usize {
        self.host.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn bridges(&self) -> Vec<Arc<FakeBridge>> {
        self.bridges.lock().clone()
    }

    pub fn last_bridge(&self) -> Option<Arc<FakeBridge>> {
        self.bridges.lock().last().cloned()
    }

    /// Dispose every live bridge, as a crashing converter would
    pub fn drop_bridges(&self) {
        for bridge in self.bridges() {
            if !bridge.is_disposed() {
                bridge.fire_disposed();
            }
        }
    }
}

#[async_trait]
impl BridgeConnector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &EndpointAddress,
        bridge_name: &str,
    ) -> BridgeResult<Arc<dyn Bridge>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_listening() {
            return Err(BridgeError::ConnectRefused {
                address: endpoint.socket_address(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        let bridge = Arc::new(FakeBridge {
            name: bridge_name.to_string(),
            host: self.host.clone(),
            disposed: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        });
        self.bridges.lock().push(bridge.clone());
        Ok(bridge)
    }
}

/// In-memory bridge.
///
/// Methods: `echo` returns its arguments, `fail` fails remotely, `hang`
/// never answers and `terminate` stops the fake host and disposes the
/// bridge.
pub struct FakeBridge {
    name: String,
    host: Arc<HostState>,
    disposed: AtomicBool,
    callbacks: Mutex<Vec<DisposeCallback>>,
}

impl FakeBridge {
    /// Deliver a disposal event, even if one was delivered before
    pub fn fire_disposed(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback();
        }
    }

    fn check_alive(&self) -> BridgeResult<()> {
        if self.is_disposed() {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for FakeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeBridge")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_service(&self, name: &str) -> BridgeResult<RemoteService> {
        self.check_alive()?;
        Ok(RemoteService {
            name: name.to_string(),
            handle: format!("{}@{}", name, self.name),
        })
    }

    async fn invoke(
        &self,
        service: &RemoteService,
        method: &str,
        args: JsonValue,
    ) -> BridgeResult<JsonValue> {
        self.check_alive()?;
        match method {
            "echo" => Ok(args),
            "fail" => Err(RemoteError::new(RemoteErrorKind::Failed, "Requested failure").into()),
            "hang" => std::future::pending().await,
            "terminate" => {
                self.host.terminate_calls.fetch_add(1, Ordering::SeqCst);
                self.host.listening.store(false, Ordering::SeqCst);
                self.fire_disposed();
                Ok(json!(true))
            }
            other => Err(BridgeError::Remote {
                kind: RemoteErrorKind::UnknownMethod,
                message: format!("{} has no method {}", service.name, other),
            }),
        }
    }

    fn on_disposed(&self, callback: DisposeCallback) {
        if self.is_disposed() {
            callback();
        } else {
            self.callbacks.lock().push(callback);
        }
    }

    async fn dispose(&self) {
        if !self.is_disposed() {
            self.fire_disposed();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    bridge_names: Mutex<Vec<String>>,
    accepted: AtomicUsize,
    terminated: AtomicUsize,
}

/// Fake converter listening on an ephemeral loopback port.
///
/// Resolves [`ROOT_OBJECT_NAME`] and [`DESKTOP_SERVICE`]. Supported
/// methods: `echo` returns its arguments, `sleep` waits `args.millis`
/// before answering, `fail` answers with a remote failure and `terminate`
/// answers `true` and then closes the socket.
#[derive(Debug)]
pub struct FakeConverter {
    endpoint: EndpointAddress,
    recorded: Arc<Recorded>,
    generation: Arc<watch::Sender<u64>>,
    acceptor: JoinHandle<()>,
}

impl FakeConverter {
    /// Bind and start accepting bridges
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake converter");
        let port = listener
            .local_addr()
            .expect("fake converter address")
            .port();

        let recorded = Arc::new(Recorded::default());
        let (generation, _) = watch::channel(0u64);
        let generation = Arc::new(generation);
        let acceptor = tokio::spawn(accept_loop(
            listener,
            recorded.clone(),
            generation.clone(),
        ));

        Self {
            endpoint: EndpointAddress::local(port),
            recorded,
            generation,
            acceptor,
        }
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint.clone()
    }

    /// Names sent in the handshake of every bridge so far
    pub fn bridge_names(&self) -> Vec<String> {
        self.recorded.bridge_names.lock().clone()
    }

    pub fn accepted_connections(&self) -> usize {
        self.recorded.accepted.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.recorded.terminated.load(Ordering::SeqCst)
    }

    /// Close every open bridge, as a crashing converter would
    pub fn drop_connections(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeConverter {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.generation.send_modify(|generation| *generation += 1);
    }
}

async fn accept_loop(
    listener: TcpListener,
    recorded: Arc<Recorded>,
    generation: Arc<watch::Sender<u64>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        recorded.accepted.fetch_add(1, Ordering::SeqCst);
        let _ = stream.set_nodelay(true);
        tokio::spawn(serve(stream, recorded.clone(), generation.subscribe()));
    }
}

async fn serve(stream: TcpStream, recorded: Arc<Recorded>, mut generation: watch::Receiver<u64>) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            _ = generation.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };

        let Ok(request) = serde_json::from_str::<MessageEnvelope<BridgeRequest>>(&line) else {
            continue;
        };
        let correlation_id = request.correlation_id;

        let (reply, close_after) = match request.message {
            BridgeRequest::Hello { bridge_name } => {
                recorded.bridge_names.lock().push(bridge_name);
                (BridgeReply::Value { value: JsonValue::Null }, false)
            }
            BridgeRequest::GetService { name } => {
                if name == ROOT_OBJECT_NAME || name == DESKTOP_SERVICE {
                    (
                        BridgeReply::Service {
                            handle: format!("{}#{}", name, correlation_id),
                        },
                        false,
                    )
                } else {
                    (
                        error_reply(RemoteErrorKind::UnknownService, format!("No service {}", name)),
                        false,
                    )
                }
            }
            BridgeRequest::Invoke { method, args, .. } => match method.as_str() {
                "echo" => (BridgeReply::Value { value: args }, false),
                "sleep" => {
                    let millis = args.get("millis").and_then(JsonValue::as_u64).unwrap_or(0);
                    let writer = writer.clone();
                    // Answer out of band so other calls keep flowing
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(millis)).await;
                        let reply = MessageEnvelope::reply_to(
                            correlation_id,
                            BridgeReply::Value { value: json!(millis) },
                        );
                        let _ = write_reply(&writer, &reply).await;
                    });
                    continue;
                }
                "fail" => (error_reply(RemoteErrorKind::Failed, "Requested failure"), false),
                "terminate" => {
                    recorded.terminated.fetch_add(1, Ordering::SeqCst);
                    (BridgeReply::Value { value: json!(true) }, true)
                }
                other => (
                    error_reply(RemoteErrorKind::UnknownMethod, format!("No method {}", other)),
                    false,
                ),
            },
            BridgeRequest::Dispose => break,
        };

        let envelope = MessageEnvelope::reply_to(correlation_id, reply);
        if write_reply(&writer, &envelope).await.is_err() || close_after {
            break;
        }
    }

    let _ = writer.lock().await.shutdown().await;
}

fn error_reply(kind: RemoteErrorKind, message: impl Into<String>) -> BridgeReply {
    BridgeReply::Error {
        error: RemoteError::new(kind, message),
    }
}

async fn write_reply(
    writer: &tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
    envelope: &MessageEnvelope<BridgeReply>,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
