//! Test doubles for the supervisor
//!
//! [`FakeProcess`] stands in for the OS process. It drives a [`FakeHost`]
//! (one of the bridge fakes) so that starting the fake makes the endpoint
//! accept bridges and killing it drops them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use officevisor_bridge::testing::{FakeConnector, FakeConverter};
use officevisor_config::ProcessSettings;
use officevisor_process::{ProcessError, ProcessResult};
use officevisor_resilience::{RetryPolicy, RetryTimer};

use crate::process::OfficeProcess;

/// Exit code reported after a forced kill
pub const KILLED_EXIT_CODE: i32 = 137;

/// Settings with budgets short enough for tests
pub fn fast_settings(work_dir: &Path) -> ProcessSettings {
    ProcessSettings {
        work_dir: work_dir.to_path_buf(),
        task_queue_timeout: Duration::from_secs(2),
        task_execution_timeout: Duration::from_secs(2),
        tasks_count_for_process_restart: 0,
        process_start_timeout: Duration::from_secs(2),
        process_start_retry_interval: Duration::from_millis(20),
        process_respond_timeout: Duration::from_millis(300),
        process_respond_retry_interval: Duration::from_millis(20),
        ..ProcessSettings::default()
    }
}

/// The endpoint side a [`FakeProcess`] controls
pub trait FakeHost: Send + Sync + fmt::Debug {
    /// Accept bridges, or drop the open ones and refuse new ones
    fn set_listening(&self, listening: bool);

    /// `terminate` requests received so far
    fn terminate_requests(&self) -> usize;
}

impl FakeHost for FakeConnector {
    fn set_listening(&self, listening: bool) {
        FakeConnector::set_listening(self, listening);
        if !listening {
            self.drop_bridges();
        }
    }

    fn terminate_requests(&self) -> usize {
        self.terminate_calls()
    }
}

/// The TCP peer always listens; stopping only drops its bridges
impl FakeHost for FakeConverter {
    fn set_listening(&self, listening: bool) {
        if !listening {
            self.drop_connections();
        }
    }

    fn terminate_requests(&self) -> usize {
        self.terminate_calls()
    }
}

/// How one launch of the fake behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeLaunch {
    /// Runs and accepts bridges
    Listen,
    /// Runs but never accepts bridges
    Silent,
    /// Exits at once with the given code
    Exit(i32),
}

/// Counters shared between a [`FakeProcess`] and the test
#[derive(Debug, Default)]
pub struct FakeProcessProbe {
    launches: Mutex<VecDeque<FakeLaunch>>,
    starts: AtomicUsize,
    restarts: AtomicUsize,
    force_kills: AtomicUsize,
    profile_deletions: AtomicUsize,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
}

impl FakeProcessProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue launch behaviours; once empty every launch is [`FakeLaunch::Listen`]
    pub fn script(&self, launches: impl IntoIterator<Item = FakeLaunch>) {
        self.launches.lock().extend(launches);
    }

    /// Calls to `start`, restarts included
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Calls to `start(true)`
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn force_kills(&self) -> usize {
        self.force_kills.load(Ordering::SeqCst)
    }

    pub fn profile_deletions(&self) -> usize {
        self.profile_deletions.load(Ordering::SeqCst)
    }

    /// Calls that began while another call was still running
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        InFlight(self)
    }

    fn next_launch(&self) -> FakeLaunch {
        self.launches.lock().pop_front().unwrap_or(FakeLaunch::Listen)
    }
}

struct InFlight<'a>(&'a FakeProcessProbe);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory converter process.
///
/// A `terminate` request received by the host after the last launch makes
/// the process exit with code 0.
#[derive(Debug)]
pub struct FakeProcess {
    probe: Arc<FakeProcessProbe>,
    host: Arc<dyn FakeHost>,
    started: bool,
    exit_code: Option<i32>,
    terminate_baseline: usize,
}

impl FakeProcess {
    pub fn new(probe: Arc<FakeProcessProbe>, host: Arc<dyn FakeHost>) -> Self {
        Self {
            probe,
            host,
            started: false,
            exit_code: None,
            terminate_baseline: 0,
        }
    }

    fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_none() && self.host.terminate_requests() > self.terminate_baseline {
            self.exit_code = Some(0);
            self.host.set_listening(false);
        }
        self.exit_code
    }
}

#[async_trait]
impl OfficeProcess for FakeProcess {
    async fn start(&mut self, restart: bool) -> ProcessResult<()> {
        let probe = self.probe.clone();
        let _guard = probe.enter();
        // Widen the window in which an overlapping call would be seen
        tokio::time::sleep(Duration::from_millis(5)).await;

        probe.starts.fetch_add(1, Ordering::SeqCst);
        if restart {
            probe.restarts.fetch_add(1, Ordering::SeqCst);
        }

        self.started = true;
        self.terminate_baseline = self.host.terminate_requests();
        match probe.next_launch() {
            FakeLaunch::Listen => {
                self.exit_code = None;
                self.host.set_listening(true);
            }
            FakeLaunch::Silent => {
                self.exit_code = None;
                self.host.set_listening(false);
            }
            FakeLaunch::Exit(code) => {
                self.exit_code = Some(code);
                self.host.set_listening(false);
            }
        }
        Ok(())
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.poll_exit()
    }

    async fn wait_exit_code(&mut self, policy: RetryPolicy) -> ProcessResult<i32> {
        let probe = self.probe.clone();
        let _guard = probe.enter();
        if !self.started {
            return Err(ProcessError::NotStarted);
        }

        let mut timer = RetryTimer::start(policy);
        loop {
            if let Some(code) = self.poll_exit() {
                return Ok(code);
            }
            if !timer.wait_next().await {
                return Err(ProcessError::RetryTimeout {
                    timeout: policy.timeout,
                });
            }
        }
    }

    async fn terminate_by_force(&mut self, _policy: RetryPolicy) -> ProcessResult<i32> {
        let probe = self.probe.clone();
        let _guard = probe.enter();
        tokio::time::sleep(Duration::from_millis(5)).await;
        if !self.started {
            return Err(ProcessError::NotStarted);
        }
        if let Some(code) = self.poll_exit() {
            return Ok(code);
        }

        probe.force_kills.fetch_add(1, Ordering::SeqCst);
        self.exit_code = Some(KILLED_EXIT_CODE);
        self.host.set_listening(false);
        Ok(KILLED_EXIT_CODE)
    }

    fn delete_profile_dir(&self) {
        self.probe.profile_deletions.fetch_add(1, Ordering::SeqCst);
    }
}
