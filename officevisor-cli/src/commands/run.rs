use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use officevisor_config::{OfficevisorConfig, ProcessSettings};
use officevisor_execution::OfficeWorker;

/// Keep one converter per configured port running until Ctrl-C
pub async fn run_command(config: OfficevisorConfig) -> Result<()> {
    let workers = start_workers(&config.office).await?;
    info!(count = workers.len(), "Converters running, press Ctrl-C to stop");

    signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Received shutdown signal");

    shutdown_workers(&workers).await;
    Ok(())
}

/// Start a worker for every endpoint.
///
/// Workers start concurrently. If any of them fails, the ones that did
/// start are shut down again.
pub(crate) async fn start_workers(settings: &ProcessSettings) -> Result<Vec<OfficeWorker>> {
    let settings = Arc::new(settings.clone());
    let workers: Vec<OfficeWorker> = settings
        .endpoints()
        .into_iter()
        .map(|endpoint| OfficeWorker::for_endpoint(settings.clone(), endpoint))
        .collect();

    info!(
        ports = ?settings.port_numbers,
        executable = %settings.office_executable().display(),
        "Starting converters"
    );
    let results = join_all(workers.iter().map(|worker| worker.start())).await;

    let mut failures = Vec::new();
    for (worker, result) in workers.iter().zip(results) {
        if let Err(e) = result {
            error!(port = worker.endpoint().port(), "Failed to start converter: {}", e);
            failures.push(format!("port {}: {}", worker.endpoint().port(), e));
        }
    }

    if !failures.is_empty() {
        shutdown_workers(&workers).await;
        return Err(anyhow!("Failed to start converters: {}", failures.join("; ")));
    }

    Ok(workers)
}

pub(crate) async fn shutdown_workers(workers: &[OfficeWorker]) {
    let results = join_all(workers.iter().map(|worker| worker.shutdown())).await;
    for (worker, result) in workers.iter().zip(results) {
        match result {
            Ok(()) => info!(port = worker.endpoint().port(), "Converter stopped"),
            Err(e) => warn!(port = worker.endpoint().port(), "Failed to stop converter: {}", e),
        }
    }
}
