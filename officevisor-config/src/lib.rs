//! Configuration for Officevisor
//!
//! This crate holds the immutable value types every other crate is built
//! from: the [`EndpointAddress`] of one converter instance and the
//! [`ProcessSettings`] that govern how that instance is launched, polled
//! and restarted. Configuration is loaded from YAML with environment
//! variable overrides and validated per domain.

pub mod domains;
pub mod endpoint;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    office::{ProcessSettings, DEFAULT_BOOTSTRAP_EXIT_CODE},
    OfficevisorConfig,
};
pub use endpoint::{EndpointAddress, BRIDGE_PROTOCOL, ROOT_OBJECT_NAME};
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;
