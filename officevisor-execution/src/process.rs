//! Seam between the supervisor and the OS process

use async_trait::async_trait;
use std::fmt;

use officevisor_process::{ExternalProcess, ProcessResult};
use officevisor_resilience::RetryPolicy;

/// Operations the supervisor needs from a converter process
#[async_trait]
pub trait OfficeProcess: Send + fmt::Debug {
    /// Launch; `restart` keeps the existing profile
    async fn start(&mut self, restart: bool) -> ProcessResult<()>;

    /// Exit code, or `None` while still running
    fn exit_code(&mut self) -> Option<i32>;

    async fn wait_exit_code(&mut self, policy: RetryPolicy) -> ProcessResult<i32>;

    async fn terminate_by_force(&mut self, policy: RetryPolicy) -> ProcessResult<i32>;

    fn delete_profile_dir(&self);
}

#[async_trait]
impl OfficeProcess for ExternalProcess {
    async fn start(&mut self, restart: bool) -> ProcessResult<()> {
        ExternalProcess::start(self, restart).await
    }

    fn exit_code(&mut self) -> Option<i32> {
        ExternalProcess::exit_code(self)
    }

    async fn wait_exit_code(&mut self, policy: RetryPolicy) -> ProcessResult<i32> {
        ExternalProcess::wait_exit_code(self, policy).await
    }

    async fn terminate_by_force(&mut self, policy: RetryPolicy) -> ProcessResult<i32> {
        ExternalProcess::terminate_by_force(self, policy).await
    }

    fn delete_profile_dir(&self) {
        ExternalProcess::delete_profile_dir(self)
    }
}
