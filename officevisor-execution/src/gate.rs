//! Availability gate in front of the task runner

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Open,
    /// Terminal; never reopens
    ShutDown,
}

/// Returned by [`Gate::wait_open`] once the gate is shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Gate shut down")]
pub struct GateShutDown;

/// Boolean "available" flag with waiters.
///
/// Clones share the same state. Opening wakes every waiter.
#[derive(Debug, Clone)]
pub struct Gate {
    state: Arc<watch::Sender<GateState>>,
}

impl Gate {
    /// A closed gate
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Closed);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn open(&self) {
        self.transition(GateState::Open);
    }

    pub fn close(&self) {
        self.transition(GateState::Closed);
    }

    pub fn shut_down(&self) {
        self.state.send_replace(GateState::ShutDown);
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }

    /// Wait until the gate is open
    pub async fn wait_open(&self) -> Result<(), GateShutDown> {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(|state| *state != GateState::Closed)
            .await
            .map_err(|_| GateShutDown)?;

        match *state {
            GateState::Open => Ok(()),
            _ => Err(GateShutDown),
        }
    }

    fn transition(&self, to: GateState) {
        self.state.send_if_modified(|state| {
            if *state == GateState::ShutDown || *state == to {
                false
            } else {
                *state = to;
                true
            }
        });
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
