//! Connection lifecycle over the TCP bridge against a fake converter

use anyhow::Result;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use officevisor_bridge::testing::FakeConverter;
use officevisor_bridge::{
    BridgeError, Connection, ConnectionEvent, ConnectionListener, RemoteErrorKind, DESKTOP_SERVICE,
};
use officevisor_config::EndpointAddress;
use officevisor_logging::init_simple_tracing;

/// Helper to suppress logging output during test execution
fn init_quiet_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = init_simple_tracing("warn,officevisor_bridge=info");
    });
}

#[derive(Default)]
struct CountingListener {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl ConnectionListener for CountingListener {
    fn on_connected(&self, _event: &ConnectionEvent) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _event: &ConnectionEvent) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_connect_and_invoke_over_tcp() -> Result<()> {
    init_quiet_logging();
    let converter = FakeConverter::start().await;
    let connection = Connection::tcp(converter.endpoint());

    connection.connect().await?;
    assert!(connection.is_connected());
    assert!(connection.service_manager().is_some());

    let value = connection
        .invoke(DESKTOP_SERVICE, "echo", json!({ "document": "report.odt" }))
        .await?;
    assert_eq!(value, json!({ "document": "report.odt" }));

    let error = connection
        .invoke(DESKTOP_SERVICE, "fail", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        BridgeError::Remote {
            kind: RemoteErrorKind::Failed,
            ..
        }
    ));

    connection.disconnect().await;
    assert!(!connection.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() -> Result<()> {
    init_quiet_logging();
    let converter = FakeConverter::start().await;
    let connection = Connection::tcp(converter.endpoint());
    connection.connect().await?;

    // The slow call answers after the fast one
    let slow = connection.invoke(DESKTOP_SERVICE, "sleep", json!({ "millis": 150 }));
    let fast = connection.invoke(DESKTOP_SERVICE, "echo", json!("fast"));
    let (slow, fast) = futures::join!(slow, fast);

    assert_eq!(slow?, json!(150));
    assert_eq!(fast?, json!("fast"));
    Ok(())
}

#[tokio::test]
async fn test_peer_loss_notifies_once_and_reconnect_uses_new_bridge() -> Result<()> {
    init_quiet_logging();
    let converter = FakeConverter::start().await;
    let connection = Connection::tcp(converter.endpoint());
    let listener = Arc::new(CountingListener::default());
    connection.add_listener(listener.clone());

    connection.connect().await?;
    converter.drop_connections();
    wait_until(|| listener.disconnected.load(Ordering::SeqCst) == 1).await;
    assert!(!connection.is_connected());

    // A deliberate disconnect afterwards is not reported again
    connection.disconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);

    connection.connect().await?;
    assert_eq!(listener.connected.load(Ordering::SeqCst), 2);

    let names = converter.bridge_names();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
    Ok(())
}

#[tokio::test]
async fn test_terminate_is_seen_as_disposal() -> Result<()> {
    init_quiet_logging();
    let converter = FakeConverter::start().await;
    let connection = Connection::tcp(converter.endpoint());
    let listener = Arc::new(CountingListener::default());
    connection.add_listener(listener.clone());
    connection.connect().await?;

    let accepted = connection
        .invoke(DESKTOP_SERVICE, "terminate", json!(null))
        .await?;
    assert_eq!(accepted, json!(true));

    wait_until(|| listener.disconnected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(converter.terminate_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_nothing_listening_is_refused() {
    init_quiet_logging();
    // Bind and release a port so that nothing listens on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let connection = Connection::tcp(EndpointAddress::local(port));

    let error = connection.connect().await.unwrap_err();

    assert!(error.is_connect_refused());
    assert!(!connection.is_connected());
}
