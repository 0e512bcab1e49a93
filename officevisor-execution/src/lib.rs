//! Supervision and task execution for Officevisor
//!
//! A [`ProcessSupervisor`] serialises start, stop and restart of one
//! converter process and its bridge connection. A
//! [`GatedSingleTaskExecutor`] runs one task at a time while the
//! connection is up. [`OfficeWorker`] ties the two together and restarts
//! the converter after a task timeout, a lost connection or a configured
//! number of tasks.

pub mod error;
pub mod executor;
pub mod gate;
pub mod process;
pub mod supervisor;
pub mod task;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use error::{
    ExecutionError, ExecutionResult, SupervisorError, SupervisorResult, TaskCancelled, TaskError,
};
pub use executor::{GatedSingleTaskExecutor, TimeoutHandler};
pub use gate::{Gate, GateShutDown, GateState};
pub use process::OfficeProcess;
pub use supervisor::{ProcessSupervisor, SupervisorState};
pub use task::{OfficeTask, ServiceProbeTask};
pub use worker::OfficeWorker;
