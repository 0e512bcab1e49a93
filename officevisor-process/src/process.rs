//! The supervised converter process

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use officevisor_config::{EndpointAddress, ProcessSettings};
use officevisor_resilience::{RetryError, RetryExecutor, RetryPolicy, RetryTimer};

use crate::error::{ProcessError, ProcessResult};
use crate::manager::{ProcessManager, ProcessQuery};
use crate::profile::{delete_profile_dir, file_uri, prepare_profile_dir};

/// PID of the converter as discovered through the host process list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    /// No discovery attempted yet
    Unknown,
    /// Discovery ran but found nothing
    NotFound,
    Found(u32),
}

/// Arguments the converter executable is launched with
pub fn build_command_args(
    endpoint: &EndpointAddress,
    instance_profile_dir: &Path,
) -> ProcessResult<Vec<String>> {
    Ok(vec![
        endpoint.accept_argument(),
        format!("-env:UserInstallation={}", file_uri(instance_profile_dir)?),
        "-headless".to_string(),
        "-nocrashreport".to_string(),
        "-nodefault".to_string(),
        "-nofirststartwizard".to_string(),
        "-nolockcheck".to_string(),
        "-nologo".to_string(),
        "-norestore".to_string(),
    ])
}

/// One converter process bound to one endpoint.
///
/// Not synchronised: the owning supervisor serialises every call.
pub struct ExternalProcess {
    settings: Arc<ProcessSettings>,
    endpoint: EndpointAddress,
    manager: Arc<dyn ProcessManager>,
    instance_profile_dir: PathBuf,
    child: Option<Child>,
    pid: Pid,
}

impl ExternalProcess {
    pub fn new(
        settings: Arc<ProcessSettings>,
        endpoint: EndpointAddress,
        manager: Arc<dyn ProcessManager>,
    ) -> Self {
        let instance_profile_dir = settings.instance_profile_dir(&endpoint);
        Self {
            settings,
            endpoint,
            manager,
            instance_profile_dir,
            child: None,
            pid: Pid::Unknown,
        }
    }

    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn instance_profile_dir(&self) -> &Path {
        &self.instance_profile_dir
    }

    fn query(&self) -> ProcessQuery {
        ProcessQuery::new(
            self.settings.executable_name(),
            self.endpoint.accept_string(),
        )
    }

    fn respond_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.process_respond_retry_interval,
            self.settings.process_respond_timeout,
        )
    }

    /// Launch the converter.
    ///
    /// A first start takes over the endpoint, killing a leftover process if
    /// allowed, and prepares a fresh instance profile. A restart keeps the
    /// profile and requires the endpoint to be free.
    pub async fn start(&mut self, restart: bool) -> ProcessResult<()> {
        let query = self.query();

        if let Some(pid) = self.manager.find_pid(&query).await? {
            if restart || !self.settings.kill_existing_process {
                return Err(ProcessError::AlreadyRunning {
                    pid,
                    endpoint: self.endpoint.to_string(),
                });
            }

            warn!(pid, port = self.endpoint.port(), "Killing process already bound to the endpoint");
            self.manager.kill(pid).await?;
            self.await_gone(&query, pid).await?;
        }

        if !restart {
            prepare_profile_dir(
                &self.instance_profile_dir,
                self.settings.template_profile_dir.as_deref(),
            )?;
        }

        let executable = self.settings.office_executable();
        let args = build_command_args(&self.endpoint, &self.instance_profile_dir)?;
        debug!(executable = %executable.display(), ?args, "Starting process");

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                executable: executable.clone(),
                source,
            })?;

        let port = self.endpoint.port();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(port, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(port, stderr));
        }
        self.child = Some(child);

        match self.manager.find_pid(&query).await? {
            Some(pid) => {
                self.pid = Pid::Found(pid);
                info!(
                    pid,
                    port,
                    profile = %self.instance_profile_dir.display(),
                    "Started process"
                );
                Ok(())
            }
            None => {
                self.pid = Pid::NotFound;
                if let Some(child) = self.child.as_mut() {
                    let _ = child.start_kill();
                }
                Err(ProcessError::PidNotFound {
                    query: query.to_string(),
                })
            }
        }
    }

    /// Exit code of the process, or `None` while it is still running
    pub fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(exit_code_of(status)),
            Ok(None) => None,
            Err(e) => {
                warn!(port = self.endpoint.port(), "Failed to query exit status: {}", e);
                None
            }
        }
    }

    /// Poll until the process has exited
    pub async fn wait_exit_code(&mut self, policy: RetryPolicy) -> ProcessResult<i32> {
        if self.child.is_none() {
            return Err(ProcessError::NotStarted);
        }

        let mut timer = RetryTimer::start(policy);
        loop {
            if let Some(code) = self.exit_code() {
                trace!(exit_code = code, attempts = timer.attempts(), "Process exited");
                return Ok(code);
            }
            if !timer.wait_next().await {
                return Err(ProcessError::RetryTimeout {
                    timeout: policy.timeout,
                });
            }
        }
    }

    /// Kill the process and wait for it to exit
    pub async fn terminate_by_force(&mut self, policy: RetryPolicy) -> ProcessResult<i32> {
        if let Some(code) = self.exit_code() {
            return Ok(code);
        }

        info!(pid = ?self.pid, port = self.endpoint.port(), "Killing process");
        if let Pid::Found(pid) = self.pid {
            // It may have exited in the meantime; the exit wait decides
            if let Err(e) = self.manager.kill(pid).await {
                warn!(pid, "Kill command failed: {}", e);
            }
        }
        // The launched child may only be a launcher for the discovered PID
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }

        self.wait_exit_code(policy).await
    }

    /// Remove the instance profile, best effort
    pub fn delete_profile_dir(&self) {
        delete_profile_dir(&self.instance_profile_dir);
    }

    // A killed process can linger in the process list for a moment
    async fn await_gone(&self, query: &ProcessQuery, pid: u32) -> ProcessResult<()> {
        let executor = RetryExecutor::new(self.respond_policy());
        let manager = &self.manager;
        let result = executor
            .execute(|| async move {
                match manager.find_pid(query).await? {
                    Some(_) => Err(ProcessError::StillRunning),
                    None => Ok(()),
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Timeout { .. }) => Err(ProcessError::AlreadyRunning {
                pid,
                endpoint: self.endpoint.to_string(),
            }),
            Err(RetryError::NonRetryable(e)) => Err(e),
        }
    }
}

impl fmt::Debug for ExternalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalProcess")
            .field("endpoint", &self.endpoint.to_string())
            .field("pid", &self.pid)
            .field("instance_profile_dir", &self.instance_profile_dir)
            .finish()
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn forward_output(port: u16, stream: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(port, "converter: {}", line);
    }
}
