//! Connection lifecycle on top of a bridge

use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use officevisor_config::{EndpointAddress, ROOT_OBJECT_NAME};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::RemoteService;
use crate::transport::{Bridge, BridgeConnector, TcpBridgeConnector};

/// Describes a connect or disconnect transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub endpoint: EndpointAddress,
    pub bridge_name: String,
}

/// Observer of connection transitions.
///
/// Called synchronously, in registration order, on whichever task detected
/// the transition. Implementations must not block.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, event: &ConnectionEvent);

    fn on_disconnected(&self, event: &ConnectionEvent);
}

#[derive(Default)]
struct ConnectionState {
    connected: bool,
    bridge: Option<Arc<dyn Bridge>>,
    service_manager: Option<RemoteService>,
}

/// Bridge to one converter endpoint.
///
/// The bridge's disposal callback is the only source of "went away"; the
/// first disposal after a successful connect notifies listeners, every
/// later one is ignored.
pub struct Connection {
    endpoint: EndpointAddress,
    connector: Arc<dyn BridgeConnector>,
    bridge_index: AtomicU64,
    state: Mutex<ConnectionState>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    this: Weak<Connection>,
}

impl Connection {
    pub fn new(endpoint: EndpointAddress, connector: Arc<dyn BridgeConnector>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoint,
            connector,
            bridge_index: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::default()),
            listeners: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Connection over the TCP bridge
    pub fn tcp(endpoint: EndpointAddress) -> Arc<Self> {
        Self::new(endpoint, Arc::new(TcpBridgeConnector::new()))
    }

    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Establish a new, uniquely named bridge and fetch the service manager
    pub async fn connect(&self) -> BridgeResult<()> {
        let index = self.bridge_index.fetch_add(1, Ordering::SeqCst);
        let bridge_name = format!("officevisor_{}_{}", self.endpoint.port(), index);
        debug!(port = self.endpoint.port(), bridge = %bridge_name, "Connecting");

        let bridge = self.connector.connect(&self.endpoint, &bridge_name).await?;

        let service_manager = match bridge.get_service(ROOT_OBJECT_NAME).await {
            Ok(service) => service,
            Err(e) => {
                bridge.dispose().await;
                return Err(BridgeError::Connection {
                    address: self.endpoint.socket_address(),
                    message: format!("Failed to retrieve {}: {}", ROOT_OBJECT_NAME, e),
                });
            }
        };

        {
            let mut state = self.state.lock();
            state.connected = true;
            state.bridge = Some(bridge.clone());
            state.service_manager = Some(service_manager);
        }

        info!(port = self.endpoint.port(), bridge = %bridge_name, "Connected");
        let event = self.event(&bridge_name);
        for listener in self.listeners() {
            listener.on_connected(&event);
        }

        // Registered last so a disconnect is never reported before the connect
        let this = self.this.clone();
        bridge.on_disposed(Arc::new(move || {
            if let Some(connection) = this.upgrade() {
                connection.handle_disposed(&bridge_name);
            }
        }));

        Ok(())
    }

    /// Dispose the current bridge, if any
    pub async fn disconnect(&self) {
        let bridge = self.state.lock().bridge.clone();

        match bridge {
            Some(bridge) => {
                debug!(port = self.endpoint.port(), bridge = %bridge.name(), "Disconnecting");
                bridge.dispose().await;
                self.handle_disposed(bridge.name());
            }
            None => debug!(port = self.endpoint.port(), "Already disconnected"),
        }
    }

    /// Resolve a named service through the current bridge
    pub async fn get_service(&self, name: &str) -> BridgeResult<RemoteService> {
        let bridge = self.current_bridge()?;
        bridge
            .get_service(name)
            .await
            .map_err(|source| BridgeError::ServiceLookup {
                service: name.to_string(),
                source: Box::new(source),
            })
    }

    /// Resolve `service` and call `method` on it
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        args: JsonValue,
    ) -> BridgeResult<JsonValue> {
        let remote = self.get_service(service).await?;
        let bridge = self.current_bridge()?;
        bridge.invoke(&remote, method, args).await
    }

    /// Root service handle of the current bridge
    pub fn service_manager(&self) -> Option<RemoteService> {
        self.state.lock().service_manager.clone()
    }

    fn current_bridge(&self) -> BridgeResult<Arc<dyn Bridge>> {
        let state = self.state.lock();
        match (&state.bridge, state.connected) {
            (Some(bridge), true) => Ok(bridge.clone()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    fn handle_disposed(&self, bridge_name: &str) {
        {
            let mut state = self.state.lock();
            let current = state
                .bridge
                .as_ref()
                .is_some_and(|bridge| bridge.name() == bridge_name);
            if !state.connected || !current {
                debug!(bridge = %bridge_name, "Ignoring disposal of inactive bridge");
                return;
            }
            state.connected = false;
            state.bridge = None;
            state.service_manager = None;
        }

        info!(port = self.endpoint.port(), bridge = %bridge_name, "Disconnected");
        let event = self.event(bridge_name);
        for listener in self.listeners() {
            listener.on_disconnected(&event);
        }
    }

    fn event(&self, bridge_name: &str) -> ConnectionEvent {
        ConnectionEvent {
            endpoint: self.endpoint.clone(),
            bridge_name: bridge_name.to_string(),
        }
    }

    // Snapshot so listeners may register further listeners
    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeConverter};
    use serde_json::json;
    use std::time::Duration;

    struct RecordingListener {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ConnectionListener for RecordingListener {
        fn on_connected(&self, event: &ConnectionEvent) {
            self.log
                .lock()
                .push(format!("{}:connected:{}", self.label, event.bridge_name));
        }

        fn on_disconnected(&self, event: &ConnectionEvent) {
            self.log
                .lock()
                .push(format!("{}:disconnected:{}", self.label, event.bridge_name));
        }
    }

    fn fake_connection() -> (Arc<Connection>, Arc<FakeConnector>, Arc<Mutex<Vec<String>>>) {
        let connector = FakeConnector::new();
        connector.set_listening(true);
        let connection = Connection::new(EndpointAddress::local(2002), connector.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        connection.add_listener(Arc::new(RecordingListener {
            label: "a",
            log: log.clone(),
        }));
        (connection, connector, log)
    }

    #[tokio::test]
    async fn test_double_disposal_notifies_once() {
        let (connection, connector, log) = fake_connection();
        connection.connect().await.unwrap();
        assert!(connection.is_connected());

        let bridge = connector.last_bridge().unwrap();
        bridge.fire_disposed();
        bridge.fire_disposed();

        assert!(!connection.is_connected());
        assert_eq!(
            *log.lock(),
            vec![
                "a:connected:officevisor_2002_0".to_string(),
                "a:disconnected:officevisor_2002_0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let (connection, connector, log) = fake_connection();
        connection.add_listener(Arc::new(RecordingListener {
            label: "b",
            log: log.clone(),
        }));

        connection.connect().await.unwrap();
        connector.drop_bridges();

        assert_eq!(
            *log.lock(),
            vec![
                "a:connected:officevisor_2002_0".to_string(),
                "b:connected:officevisor_2002_0".to_string(),
                "a:disconnected:officevisor_2002_0".to_string(),
                "b:disconnected:officevisor_2002_0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_connect_leaves_state_untouched() {
        let (connection, connector, log) = fake_connection();
        connector.set_listening(false);

        let error = connection.connect().await.unwrap_err();

        assert!(error.is_connect_refused());
        assert!(!connection.is_connected());
        assert!(log.lock().is_empty());
        assert!(matches!(
            connection.get_service("anything").await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_stale_bridges_are_ignored() {
        let (connection, connector, log) = fake_connection();

        connection.connect().await.unwrap();
        let first = connector.last_bridge().unwrap();
        connection.disconnect().await;
        connection.disconnect().await;

        connection.connect().await.unwrap();
        let second = connector.last_bridge().unwrap();
        assert_ne!(first.name(), second.name());

        // A late event from the old bridge must not drop the new one
        first.fire_disposed();
        assert!(connection.is_connected());

        assert_eq!(
            *log.lock(),
            vec![
                "a:connected:officevisor_2002_0".to_string(),
                "a:disconnected:officevisor_2002_0".to_string(),
                "a:connected:officevisor_2002_1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_failures_surface_unchanged() {
        let (connection, _, _) = fake_connection();
        connection.connect().await.unwrap();
        assert_eq!(
            connection.service_manager().unwrap().name,
            ROOT_OBJECT_NAME
        );

        let echoed = connection
            .invoke(ROOT_OBJECT_NAME, "echo", json!("hi"))
            .await
            .unwrap();
        assert_eq!(echoed, json!("hi"));

        let failed = connection
            .invoke(ROOT_OBJECT_NAME, "fail", JsonValue::Null)
            .await
            .unwrap_err();
        assert!(matches!(failed, BridgeError::Remote { .. }));
        assert!(!failed.is_disposed());
    }

    #[tokio::test]
    async fn test_tcp_connection_detects_peer_loss() {
        let converter = FakeConverter::start().await;
        let connection = Connection::tcp(converter.endpoint());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        struct Notify(tokio::sync::mpsc::UnboundedSender<&'static str>);
        impl ConnectionListener for Notify {
            fn on_connected(&self, _: &ConnectionEvent) {
                let _ = self.0.send("connected");
            }
            fn on_disconnected(&self, _: &ConnectionEvent) {
                let _ = self.0.send("disconnected");
            }
        }
        connection.add_listener(Arc::new(Notify(tx)));

        connection.connect().await.unwrap();
        let value = connection
            .invoke(ROOT_OBJECT_NAME, "echo", json!([1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(value, json!([1, 2, 3]));

        converter.drop_connections();

        assert_eq!(rx.recv().await, Some("connected"));
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some("disconnected"));
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_wrapped() {
        let converter = FakeConverter::start().await;
        let connection = Connection::tcp(converter.endpoint());
        connection.connect().await.unwrap();

        match connection.get_service("com.example.Missing").await {
            Err(BridgeError::ServiceLookup { service, source }) => {
                assert_eq!(service, "com.example.Missing");
                assert!(matches!(*source, BridgeError::Remote { .. }));
            }
            other => panic!("expected lookup failure, got {:?}", other),
        }

        connection.disconnect().await;
        assert!(!connection.is_connected());
    }
}
