//! Configuration loading and environment variable handling

use crate::domains::logging::LoggingConfig;
use crate::domains::office::ProcessSettings;
use crate::domains::OfficevisorConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration loader with environment variable support
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "OFFICEVISOR".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<OfficevisorConfig> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let content = std::fs::read_to_string(path)?;
        let mut config: OfficevisorConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<OfficevisorConfig> {
        let mut config = OfficevisorConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<OfficevisorConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut OfficevisorConfig) -> ConfigResult<()> {
        self.apply_office_overrides(&mut config.office)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply converter process overrides
    fn apply_office_overrides(&self, config: &mut ProcessSettings) -> ConfigResult<()> {
        if let Ok(home) = self.get_env_var("OFFICE_HOME") {
            config.office_location = PathBuf::from(home);
        }

        if let Ok(work_dir) = self.get_env_var("WORK_DIR") {
            config.work_dir = PathBuf::from(work_dir);
        }

        if let Ok(template) = self.get_env_var("TEMPLATE_PROFILE_DIR") {
            config.template_profile_dir = Some(PathBuf::from(template));
        }

        if let Ok(ports) = self.get_env_var("PORT_NUMBERS") {
            config.port_numbers = ports
                .split(',')
                .map(|port| port.trim().parse::<u16>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::EnvError(format!("Invalid PORT_NUMBERS: {}", e)))?;
        }

        if let Some(timeout) = self.get_env_seconds("TASK_EXECUTION_TIMEOUT")? {
            config.task_execution_timeout = timeout;
        }

        if let Some(timeout) = self.get_env_seconds("TASK_QUEUE_TIMEOUT")? {
            config.task_queue_timeout = timeout;
        }

        if let Ok(max_tasks) = self.get_env_var("MAX_TASKS_PER_PROCESS") {
            config.tasks_count_for_process_restart = max_tasks.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid MAX_TASKS_PER_PROCESS: {}", e))
            })?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Read a whole number of seconds from the environment
    fn get_env_seconds(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let seconds: u64 = value
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(Duration::from_secs(seconds)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
