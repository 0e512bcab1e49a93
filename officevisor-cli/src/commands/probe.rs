use anyhow::{anyhow, Result};
use tracing::error;

use officevisor_config::OfficevisorConfig;
use officevisor_execution::ServiceProbeTask;

use super::run::{shutdown_workers, start_workers};

/// Start every converter, resolve its desktop service once, stop it again
pub async fn probe_command(config: OfficevisorConfig) -> Result<()> {
    let workers = start_workers(&config.office).await?;

    let mut failed = 0;
    for worker in &workers {
        let port = worker.endpoint().port();
        match worker.execute(ServiceProbeTask).await {
            Ok(service) => println!(
                "{}: {} ({})",
                worker.endpoint().socket_address(),
                service.name,
                service.handle
            ),
            Err(e) => {
                error!(port, "Probe failed: {}", e);
                println!("{}: FAILED ({})", worker.endpoint().socket_address(), e);
                failed += 1;
            }
        }
    }

    shutdown_workers(&workers).await;

    if failed > 0 {
        return Err(anyhow!("{} of {} converters failed the probe", failed, workers.len()));
    }
    Ok(())
}
