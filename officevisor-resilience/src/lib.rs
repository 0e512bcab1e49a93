//! Resilience patterns for Officevisor
//!
//! Every wait in the supervisor is a poll at a fixed interval bounded by a
//! total time budget: waiting for a process to exit, waiting for a bridge
//! to come up. This crate provides that loop once.

pub mod retry;

// Re-export commonly used types
pub use retry::{RetryError, RetryExecutor, RetryPolicy, RetryTimer, Retryable};
