//! Error types for supervision and task execution

use std::time::Duration;
use thiserror::Error;

use officevisor_bridge::BridgeError;
use officevisor_process::ProcessError;

/// Error returned by a task body, kept intact for the caller
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Fatal outcomes of a lifecycle operation
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Connect attempts used up the whole budget
    #[error("Could not connect to {address} within {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// The process exited with an unexpected code before a bridge was up
    #[error("Process died during startup with exit code {exit_code}")]
    ProcessDiedDuringStartup { exit_code: i32 },

    #[error("Process management error: {0}")]
    Process(#[from] ProcessError),

    /// Bridge failure other than a refused connection
    #[error("Connection error: {0}")]
    Connection(#[from] BridgeError),

    /// The control task is gone
    #[error("Supervisor has shut down")]
    ShutDown,
}

/// Outcomes of [`crate::OfficeWorker::execute`] other than success
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The task exceeded its budget; the process is being restarted
    #[error("Task did not complete within {timeout:?}")]
    TaskTimeout { timeout: Duration },

    /// The task body failed or was cancelled
    #[error("Task failed: {0}")]
    TaskFailed(#[source] TaskError),

    /// The task could not be submitted
    #[error("Worker unavailable: {0}")]
    Unavailable(String),
}

impl ExecutionError {
    /// The task's own error, if it is of type `E`
    pub fn task_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            ExecutionError::TaskFailed(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Take the task's own error back out, if it is of type `E`
    pub fn into_task_error<E>(self) -> Result<E, Self>
    where
        E: std::error::Error + 'static,
    {
        match self {
            ExecutionError::TaskFailed(error) => match error.downcast::<E>() {
                Ok(error) => Ok(*error),
                Err(error) => Err(ExecutionError::TaskFailed(error)),
            },
            other => Err(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::TaskTimeout { .. })
    }
}

/// Reported through [`ExecutionError::TaskFailed`] when a task is cut short
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Task cancelled: {reason}")]
pub struct TaskCancelled {
    pub reason: String,
}

impl TaskCancelled {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
