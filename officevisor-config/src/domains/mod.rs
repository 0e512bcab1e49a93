//! Domain-specific configuration modules

pub mod logging;
pub mod office;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Officevisor configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OfficevisorConfig {
    /// Converter process configuration
    #[serde(default)]
    pub office: office::ProcessSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl OfficevisorConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.office.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = OfficevisorConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
