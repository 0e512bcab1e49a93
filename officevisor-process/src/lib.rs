//! Converter process handling for Officevisor
//!
//! [`ExternalProcess`] owns one OS-level converter process: it spawns it
//! with an instance-private user profile, discovers its PID through the
//! host process list, polls for its exit code and kills it by force.
//! Host process queries go through the [`ProcessManager`] trait.

pub mod error;
pub mod manager;
pub mod process;
pub mod profile;

// Re-export commonly used types
pub use error::{ProcessError, ProcessResult};
pub use manager::{
    default_process_manager, ProcessManager, ProcessQuery, UnixProcessManager,
    WindowsProcessManager,
};
pub use process::{build_command_args, ExternalProcess, Pid};
pub use profile::{delete_profile_dir, file_uri, prepare_profile_dir};
