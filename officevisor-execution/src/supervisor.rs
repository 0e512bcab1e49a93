//! Process supervisor
//!
//! Every lifecycle operation on one converter (start, stop, restart and the
//! two fire-and-forget restart triggers) runs on a single control task, in
//! the order it was submitted. Callers of the `*_and_wait` methods block
//! until their unit of work has finished on that task.

use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use officevisor_bridge::{Connection, ConnectionEvent, ConnectionListener, DESKTOP_SERVICE};
use officevisor_config::{EndpointAddress, ProcessSettings};
use officevisor_process::{default_process_manager, ExternalProcess, ProcessError};
use officevisor_resilience::{RetryPolicy, RetryTimer, Retryable};

use crate::error::{SupervisorError, SupervisorResult};
use crate::executor::TimeoutHandler;
use crate::process::OfficeProcess;

/// Lifecycle state of a supervised converter.
///
/// `Stopped` and `Connected` are stable; the others only last while a
/// unit of work is running on the control task, except `Disconnected`,
/// which holds until the queued lost-connection restart runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Connected,
    Disconnected,
    Stopping,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Connected => "connected",
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

type Reply = oneshot::Sender<SupervisorResult<()>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Restart(Reply),
    RestartDueToTaskTimeout,
    RestartDueToLostConnection,
}

/// Serialises start, stop and restart of one process and its connection
pub struct ProcessSupervisor {
    endpoint: EndpointAddress,
    connection: Arc<Connection>,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl ProcessSupervisor {
    /// Spawn the control task for `process` and `connection`
    pub fn new(
        settings: Arc<ProcessSettings>,
        process: Box<dyn OfficeProcess>,
        connection: Arc<Connection>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        let state = Arc::new(state);
        connection.add_listener(Arc::new(StateListener {
            state: state.clone(),
        }));

        let (commands, receiver) = mpsc::unbounded_channel();
        let control = Control {
            start_policy: RetryPolicy::new(
                settings.process_start_retry_interval,
                settings.process_start_timeout,
            ),
            respond_policy: RetryPolicy::new(
                settings.process_respond_retry_interval,
                settings.process_respond_timeout,
            ),
            bootstrap_exit_code: settings.bootstrap_exit_code,
            process,
            connection: connection.clone(),
            state: state.clone(),
        };
        tokio::spawn(control.run(receiver));

        Arc::new(Self {
            endpoint: connection.endpoint().clone(),
            connection,
            commands,
            state,
        })
    }

    /// Supervisor for a real converter process reached over TCP
    pub fn for_endpoint(settings: Arc<ProcessSettings>, endpoint: EndpointAddress) -> Arc<Self> {
        let process = ExternalProcess::new(
            settings.clone(),
            endpoint.clone(),
            default_process_manager(),
        );
        let connection = Connection::tcp(endpoint);
        Self::new(settings, Box::new(process), connection)
    }

    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Start the process and connect to it within the start budget
    pub async fn start_and_wait(&self) -> SupervisorResult<()> {
        self.call(Command::Start).await
    }

    /// Terminate the process, wait for it to exit and remove its profile
    pub async fn stop_and_wait(&self) -> SupervisorResult<()> {
        self.call(Command::Stop).await
    }

    /// Stop, then start within the respond budget, as one unit of work
    pub async fn restart_and_wait(&self) -> SupervisorResult<()> {
        self.call(Command::Restart).await
    }

    /// Kill the process in the background.
    ///
    /// The resulting disposal reaches connection listeners as an
    /// unexpected disconnect, which is what brings the process back.
    pub fn restart_due_to_task_timeout(&self) {
        self.submit(Command::RestartDueToTaskTimeout);
    }

    /// Wait for the old process to exit and start a new one, in the
    /// background. Failures are only logged.
    pub fn restart_due_to_lost_connection(&self) {
        self.submit(Command::RestartDueToLostConnection);
    }

    async fn call(&self, command: fn(Reply) -> Command) -> SupervisorResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SupervisorError::ShutDown)?;
        response.await.map_err(|_| SupervisorError::ShutDown)?
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(port = self.endpoint.port(), "Supervisor has shut down; dropping restart");
        }
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl TimeoutHandler for ProcessSupervisor {
    fn on_task_timeout(&self) {
        self.restart_due_to_task_timeout();
    }
}

struct StateListener {
    state: Arc<watch::Sender<SupervisorState>>,
}

impl ConnectionListener for StateListener {
    fn on_connected(&self, _event: &ConnectionEvent) {}

    fn on_disconnected(&self, _event: &ConnectionEvent) {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Connected {
                *state = SupervisorState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

/// State owned by the control task
struct Control {
    start_policy: RetryPolicy,
    respond_policy: RetryPolicy,
    bootstrap_exit_code: i32,
    process: Box<dyn OfficeProcess>,
    connection: Arc<Connection>,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl Control {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start(reply) => {
                    let result = self.start(self.start_policy).await;
                    let _ = reply.send(result);
                }
                Command::Stop(reply) => {
                    let result = self.stop().await;
                    let _ = reply.send(result);
                }
                Command::Restart(reply) => {
                    let result = self.restart().await;
                    let _ = reply.send(result);
                }
                Command::RestartDueToTaskTimeout => self.kill_after_task_timeout().await,
                Command::RestartDueToLostConnection => self.restart_after_lost_connection().await,
            }
        }
        debug!(port = self.port(), "Supervisor control task finished");
    }

    fn port(&self) -> u16 {
        self.connection.endpoint().port()
    }

    fn current_state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(port = self.port(), from = %previous, to = %state, "Supervisor state changed");
        }
    }

    async fn start(&mut self, policy: RetryPolicy) -> SupervisorResult<()> {
        if self.current_state() == SupervisorState::Connected && self.connection.is_connected() {
            debug!(port = self.port(), "Already connected");
            return Ok(());
        }

        self.set_state(SupervisorState::Starting);
        match self.start_and_connect(policy).await {
            Ok(()) => {
                self.set_state(SupervisorState::Connected);
                Ok(())
            }
            Err(e) => {
                error!(port = self.port(), "Failed to start converter: {}", e);
                self.discard_failed_start().await;
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    async fn start_and_connect(&mut self, policy: RetryPolicy) -> SupervisorResult<()> {
        self.process.start(false).await?;

        let mut timer = RetryTimer::start(policy);
        let mut bootstrap_restarted = false;
        loop {
            match self.connection.connect().await {
                Ok(()) => {
                    info!(
                        port = self.port(),
                        attempts = timer.attempts(),
                        "Converter started and connected"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() => match self.process.exit_code() {
                    None => trace!(port = self.port(), "Converter not listening yet: {}", e),
                    Some(code) if code == self.bootstrap_exit_code && !bootstrap_restarted => {
                        info!(
                            port = self.port(),
                            exit_code = code,
                            "Converter exited after creating its profile, starting it again"
                        );
                        bootstrap_restarted = true;
                        self.process.start(true).await?;
                    }
                    Some(code) => {
                        return Err(SupervisorError::ProcessDiedDuringStartup { exit_code: code })
                    }
                },
                Err(e) => return Err(SupervisorError::Connection(e)),
            }

            if !timer.wait_next().await {
                return Err(SupervisorError::ConnectTimeout {
                    address: self.connection.endpoint().socket_address(),
                    timeout: policy.timeout,
                });
            }
        }
    }

    // A spawned process that never answered is not left behind
    async fn discard_failed_start(&mut self) {
        if self.process.exit_code().is_some() {
            return;
        }
        let policy = self.respond_policy;
        match self.process.terminate_by_force(policy).await {
            Ok(code) => debug!(port = self.port(), exit_code = code, "Killed unresponsive converter"),
            Err(ProcessError::NotStarted) => {}
            Err(e) => warn!(port = self.port(), "Failed to kill unresponsive converter: {}", e),
        }
    }

    async fn stop(&mut self) -> SupervisorResult<()> {
        if self.current_state() == SupervisorState::Stopped {
            debug!(port = self.port(), "Already stopped");
            return Ok(());
        }

        self.set_state(SupervisorState::Stopping);
        let policy = self.respond_policy;

        match self
            .connection
            .invoke(DESKTOP_SERVICE, "terminate", JsonValue::Null)
            .await
        {
            Ok(_) => debug!(port = self.port(), "Converter accepted terminate"),
            Err(e) if e.is_disposed() => {
                debug!(port = self.port(), "Converter went away while terminating")
            }
            Err(e) => {
                warn!(port = self.port(), "Graceful terminate failed, killing converter: {}", e);
                if let Err(e) = self.process.terminate_by_force(policy).await {
                    warn!(port = self.port(), "Failed to kill converter: {}", e);
                }
            }
        }

        let result = self.ensure_process_exited(policy).await;
        self.process.delete_profile_dir();
        self.connection.disconnect().await;
        self.set_state(SupervisorState::Stopped);

        match result {
            Ok(code) => {
                info!(port = self.port(), exit_code = code, "Converter stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn restart(&mut self) -> SupervisorResult<()> {
        self.stop().await?;
        self.start(self.respond_policy).await
    }

    async fn kill_after_task_timeout(&mut self) {
        if self.current_state() != SupervisorState::Connected {
            debug!(port = self.port(), state = %self.current_state(), "Not killing converter after task timeout");
            return;
        }

        info!(port = self.port(), "Killing converter after task timeout");
        let policy = self.respond_policy;
        if let Err(e) = self.process.terminate_by_force(policy).await {
            warn!(port = self.port(), "Failed to kill converter: {}", e);
        }
    }

    async fn restart_after_lost_connection(&mut self) {
        match self.current_state() {
            SupervisorState::Stopped => {
                debug!(port = self.port(), "Stopped; not restarting after lost connection");
                return;
            }
            _ if self.connection.is_connected() => {
                debug!(port = self.port(), "Already reconnected");
                return;
            }
            _ => {}
        }

        info!(port = self.port(), "Connection lost, restarting converter");
        let policy = self.respond_policy;
        if let Err(e) = self.ensure_process_exited(policy).await {
            warn!(port = self.port(), "Old converter did not exit cleanly: {}", e);
        }

        // The failure is already logged by start and leaves the state Stopped
        let _ = self.start(self.start_policy).await;
    }

    /// Wait for exit, escalating to a forced kill once the budget is spent
    async fn ensure_process_exited(&mut self, policy: RetryPolicy) -> SupervisorResult<i32> {
        match self.process.wait_exit_code(policy).await {
            Ok(code) => Ok(code),
            Err(ProcessError::RetryTimeout { .. }) => {
                warn!(port = self.port(), "Converter did not exit within {:?}, killing it", policy.timeout);
                Ok(self.process.terminate_by_force(policy).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_settings, FakeLaunch, FakeProcess, FakeProcessProbe};
    use officevisor_bridge::testing::FakeConnector;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        supervisor: Arc<ProcessSupervisor>,
        probe: Arc<FakeProcessProbe>,
        connector: Arc<FakeConnector>,
        _work_dir: TempDir,
    }

    fn harness(launches: Vec<FakeLaunch>) -> Harness {
        let work_dir = TempDir::new().unwrap();
        let settings = Arc::new(fast_settings(work_dir.path()));
        let endpoint = EndpointAddress::local(2002);

        let probe = FakeProcessProbe::new();
        probe.script(launches);
        let connector = FakeConnector::new();
        let process = FakeProcess::new(probe.clone(), connector.clone());
        let connection = Connection::new(endpoint, connector.clone());

        Harness {
            supervisor: ProcessSupervisor::new(settings, Box::new(process), connection),
            probe,
            connector,
            _work_dir: work_dir,
        }
    }

    async fn wait_for_state(supervisor: &ProcessSupervisor, expected: SupervisorState) {
        let mut states = supervisor.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == expected),
        )
        .await
        .expect("state not reached")
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_connects() {
        let h = harness(vec![]);

        h.supervisor.start_and_wait().await.unwrap();

        assert_eq!(h.supervisor.state(), SupervisorState::Connected);
        assert!(h.supervisor.connection().is_connected());
        assert_eq!(h.probe.starts(), 1);
        assert_eq!(h.probe.restarts(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_exit_code_restarts_once() {
        let h = harness(vec![FakeLaunch::Exit(81)]);

        h.supervisor.start_and_wait().await.unwrap();

        assert_eq!(h.probe.starts(), 2);
        assert_eq!(h.probe.restarts(), 1);
        assert_eq!(h.supervisor.state(), SupervisorState::Connected);
    }

    #[tokio::test]
    async fn test_second_bootstrap_exit_is_fatal() {
        let h = harness(vec![FakeLaunch::Exit(81), FakeLaunch::Exit(81)]);

        let error = h.supervisor.start_and_wait().await.unwrap_err();

        assert!(matches!(
            error,
            SupervisorError::ProcessDiedDuringStartup { exit_code: 81 }
        ));
        assert_eq!(h.probe.starts(), 2);
        assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_unexpected_exit_code_is_not_retried() {
        let h = harness(vec![FakeLaunch::Exit(1)]);

        let error = h.supervisor.start_and_wait().await.unwrap_err();

        assert!(matches!(
            error,
            SupervisorError::ProcessDiedDuringStartup { exit_code: 1 }
        ));
        assert_eq!(h.probe.starts(), 1);
        assert_eq!(h.connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_silent_process_times_out() {
        let h = harness(vec![FakeLaunch::Silent]);

        let error = h.supervisor.start_and_wait().await.unwrap_err();

        assert!(matches!(error, SupervisorError::ConnectTimeout { .. }));
        assert!(h.connector.connect_attempts() > 1);
        assert_eq!(h.probe.force_kills(), 1);
        assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_terminates_gracefully() {
        let h = harness(vec![]);
        h.supervisor.start_and_wait().await.unwrap();

        h.supervisor.stop_and_wait().await.unwrap();

        assert_eq!(h.connector.terminate_calls(), 1);
        assert_eq!(h.probe.force_kills(), 0);
        assert_eq!(h.probe.profile_deletions(), 1);
        assert!(!h.supervisor.connection().is_connected());
        assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_connection_kills() {
        let h = harness(vec![]);
        h.supervisor.start_and_wait().await.unwrap();
        h.connector.drop_bridges();
        wait_for_state(&h.supervisor, SupervisorState::Disconnected).await;

        h.supervisor.stop_and_wait().await.unwrap();

        assert_eq!(h.connector.terminate_calls(), 0);
        assert_eq!(h.probe.force_kills(), 1);
        assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_reconnects() {
        let h = harness(vec![]);
        h.supervisor.start_and_wait().await.unwrap();

        h.supervisor.restart_and_wait().await.unwrap();

        assert_eq!(h.probe.starts(), 2);
        assert_eq!(h.connector.bridges().len(), 2);
        assert_eq!(h.supervisor.state(), SupervisorState::Connected);
    }

    #[tokio::test]
    async fn test_lifecycle_calls_never_overlap() {
        let h = harness(vec![]);
        let mut handles = Vec::new();

        for i in 0..12 {
            let supervisor = h.supervisor.clone();
            handles.push(tokio::spawn(async move {
                match i % 3 {
                    0 => supervisor.start_and_wait().await,
                    1 => supervisor.restart_and_wait().await,
                    _ => supervisor.stop_and_wait().await,
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.probe.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_lost_connection_restart() {
        let h = harness(vec![]);
        h.supervisor.start_and_wait().await.unwrap();

        h.connector.drop_bridges();
        assert_eq!(h.supervisor.state(), SupervisorState::Disconnected);
        h.supervisor.restart_due_to_lost_connection();

        wait_for_state(&h.supervisor, SupervisorState::Connected).await;
        // The old process never exited on its own
        assert_eq!(h.probe.force_kills(), 1);
        assert_eq!(h.probe.starts(), 2);
    }

    #[tokio::test]
    async fn test_lost_connection_restart_skipped_after_stop() {
        let h = harness(vec![]);
        h.supervisor.start_and_wait().await.unwrap();
        h.supervisor.stop_and_wait().await.unwrap();

        h.supervisor.restart_due_to_lost_connection();
        // Queued behind this no-op stop, so it has run once this returns
        h.supervisor.stop_and_wait().await.unwrap();

        assert_eq!(h.probe.starts(), 1);
        assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_task_timeout_kills_process() {
        let h = harness(vec![]);
        h.supervisor.start_and_wait().await.unwrap();

        h.supervisor.on_task_timeout();

        wait_for_state(&h.supervisor, SupervisorState::Disconnected).await;
        assert_eq!(h.probe.force_kills(), 1);
        assert!(!h.supervisor.connection().is_connected());
    }
}
