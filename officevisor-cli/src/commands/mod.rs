//! Command implementations

mod config;
mod probe;
mod run;

pub use config::{check_config_command, sample_config_command};
pub use probe::probe_command;
pub use run::run_command;
