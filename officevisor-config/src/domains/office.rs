//! Converter process configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::EndpointAddress;
use crate::error::ConfigResult;
use crate::validation::{
    validate_duration, validate_existing_dir, validate_positive, validate_required_string,
    Validatable,
};

/// Exit code of a first launch that only created the user installation
/// and then terminated itself.
pub const DEFAULT_BOOTSTRAP_EXIT_CODE: i32 = 81;

/// Settings for one supervised converter process.
///
/// Loaded once and shared read-only by the supervisor, the process handle
/// and the worker for their whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Installation directory of the office suite
    #[serde(default = "default_office_location")]
    pub office_location: PathBuf,

    /// Profile copied into every fresh instance profile; must contain `user/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_profile_dir: Option<PathBuf>,

    /// Parent directory of the instance profiles
    #[serde(default = "std::env::temp_dir")]
    pub work_dir: PathBuf,

    /// Host the converter accepts bridge connections on
    #[serde(default = "default_host")]
    pub host: String,

    /// One converter process is supervised per port
    #[serde(default = "default_port_numbers")]
    pub port_numbers: Vec<u16>,

    /// Maximum time a task waits for a free slot in the executor queue
    #[serde(with = "humantime_serde", default = "default_task_queue_timeout")]
    pub task_queue_timeout: Duration,

    /// Maximum time a task may take, queueing included
    #[serde(with = "humantime_serde", default = "default_task_execution_timeout")]
    pub task_execution_timeout: Duration,

    /// Restart the process after this many tasks; 0 disables
    #[serde(default = "default_tasks_count_for_process_restart")]
    pub tasks_count_for_process_restart: u32,

    /// Budget for the initial start-and-connect sequence
    #[serde(with = "humantime_serde", default = "default_process_timeout")]
    pub process_start_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub process_start_retry_interval: Duration,

    /// Budget for waiting on exit codes and for reconnecting after a restart
    #[serde(with = "humantime_serde", default = "default_process_timeout")]
    pub process_respond_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub process_respond_retry_interval: Duration,

    /// Exit code treated as "first launch created the profile, start again"
    #[serde(default = "default_bootstrap_exit_code")]
    pub bootstrap_exit_code: i32,

    /// Kill a process already bound to our endpoint instead of failing
    #[serde(default = "crate::domains::utils::default_true")]
    pub kill_existing_process: bool,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            office_location: default_office_location(),
            template_profile_dir: None,
            work_dir: std::env::temp_dir(),
            host: default_host(),
            port_numbers: default_port_numbers(),
            task_queue_timeout: default_task_queue_timeout(),
            task_execution_timeout: default_task_execution_timeout(),
            tasks_count_for_process_restart: default_tasks_count_for_process_restart(),
            process_start_timeout: default_process_timeout(),
            process_start_retry_interval: default_retry_interval(),
            process_respond_timeout: default_process_timeout(),
            process_respond_retry_interval: default_retry_interval(),
            bootstrap_exit_code: DEFAULT_BOOTSTRAP_EXIT_CODE,
            kill_existing_process: true,
        }
    }
}

impl ProcessSettings {
    /// Path of the converter executable inside `office_location`
    pub fn office_executable(&self) -> PathBuf {
        office_executable_in(&self.office_location)
    }

    /// File name the executable shows up as in host process listings
    pub fn executable_name(&self) -> &'static str {
        if cfg!(windows) {
            "soffice.bin"
        } else {
            "soffice"
        }
    }

    /// One endpoint per configured port
    pub fn endpoints(&self) -> Vec<EndpointAddress> {
        self.port_numbers
            .iter()
            .map(|port| EndpointAddress::socket(self.host.clone(), *port))
            .collect()
    }

    /// Instance profile directory for the given endpoint
    pub fn instance_profile_dir(&self, endpoint: &EndpointAddress) -> PathBuf {
        self.work_dir.join(endpoint.profile_dir_name())
    }
}

/// Resolve the converter executable below an installation directory
pub fn office_executable_in(office_location: &Path) -> PathBuf {
    if cfg!(target_os = "macos") {
        office_location.join("Contents").join("MacOS").join("soffice")
    } else if cfg!(windows) {
        office_location.join("program").join("soffice.exe")
    } else {
        office_location.join("program").join("soffice")
    }
}

impl Validatable for ProcessSettings {
    fn validate(&self) -> ConfigResult<()> {
        let executable = self.office_executable();
        if !executable.is_file() {
            return Err(self.validation_error(format!(
                "office_location {} does not contain the executable {}",
                self.office_location.display(),
                executable.display()
            )));
        }

        if let Some(ref template) = self.template_profile_dir {
            if !template.join("user").is_dir() {
                return Err(self.validation_error(format!(
                    "template_profile_dir {} does not contain a 'user' directory",
                    template.display()
                )));
            }
        }

        validate_existing_dir(&self.work_dir, "work_dir", self.domain_name())?;
        validate_required_string(&self.host, "host", self.domain_name())?;

        if self.port_numbers.is_empty() {
            return Err(self.validation_error("port_numbers must contain at least one port"));
        }
        let mut seen = HashSet::new();
        for port in &self.port_numbers {
            validate_positive(*port, "port_numbers entry", self.domain_name())?;
            if !seen.insert(port) {
                return Err(self.validation_error(format!("duplicate port number {}", port)));
            }
        }

        validate_duration(self.task_queue_timeout, "task_queue_timeout", self.domain_name())?;
        validate_duration(
            self.task_execution_timeout,
            "task_execution_timeout",
            self.domain_name(),
        )?;
        validate_duration(
            self.process_start_timeout,
            "process_start_timeout",
            self.domain_name(),
        )?;
        validate_duration(
            self.process_start_retry_interval,
            "process_start_retry_interval",
            self.domain_name(),
        )?;
        validate_duration(
            self.process_respond_timeout,
            "process_respond_timeout",
            self.domain_name(),
        )?;
        validate_duration(
            self.process_respond_retry_interval,
            "process_respond_retry_interval",
            self.domain_name(),
        )?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "office"
    }
}

// Default value functions
fn default_office_location() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Applications/LibreOffice.app")
    } else if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\LibreOffice")
    } else {
        PathBuf::from("/usr/lib/libreoffice")
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_numbers() -> Vec<u16> {
    vec![2002]
}

fn default_task_queue_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_task_execution_timeout() -> Duration {
    Duration::from_secs(120) // 2 minutes
}

fn default_tasks_count_for_process_restart() -> u32 {
    200
}

fn default_process_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_bootstrap_exit_code() -> i32 {
    DEFAULT_BOOTSTRAP_EXIT_CODE
}
