//! Work run against a connected converter

use async_trait::async_trait;
use std::sync::Arc;

use officevisor_bridge::{BridgeError, Connection, RemoteService, DESKTOP_SERVICE};

/// One unit of work for a worker, such as a document conversion.
///
/// Runs on the worker's task runner with exclusive use of the connection.
/// Its error type is handed back to the caller of
/// [`crate::OfficeWorker::execute`] unchanged.
#[async_trait]
pub trait OfficeTask: Send + Sync + 'static {
    type Output: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn execute(&self, connection: &Arc<Connection>) -> Result<Self::Output, Self::Error>;
}

/// Resolves the desktop service; used to check a worker end to end
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceProbeTask;

#[async_trait]
impl OfficeTask for ServiceProbeTask {
    type Output = RemoteService;
    type Error = BridgeError;

    async fn execute(&self, connection: &Arc<Connection>) -> Result<RemoteService, BridgeError> {
        connection.get_service(DESKTOP_SERVICE).await
    }
}
