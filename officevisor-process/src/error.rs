//! Process management errors

use officevisor_resilience::Retryable;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors raised while managing a converter process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be launched
    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A host command (process listing, kill) failed
    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The spawned process does not show up in the host process list
    #[error("Could not find the PID of a process matching {query}")]
    PidNotFound { query: String },

    /// Another process already serves the endpoint
    #[error("A process with PID {pid} is already running on {endpoint}")]
    AlreadyRunning { pid: u32, endpoint: String },

    /// Operation needs a process that was never started
    #[error("Process not started")]
    NotStarted,

    /// The process has not exited yet
    #[error("Process still running")]
    StillRunning,

    /// A bounded poll ran out of time
    #[error("Process did not exit within {timeout:?}")]
    RetryTimeout { timeout: Duration },
}

impl Retryable for ProcessError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::StillRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_still_running_is_retryable() {
        assert!(ProcessError::StillRunning.is_retryable());
        assert!(!ProcessError::NotStarted.is_retryable());
        assert!(!ProcessError::RetryTimeout {
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
    }
}
