//! Worker binding a supervisor to a task executor

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use officevisor_bridge::{ConnectionEvent, ConnectionListener};
use officevisor_config::{EndpointAddress, ProcessSettings};

use crate::error::{ExecutionError, ExecutionResult, SupervisorResult, TaskError};
use crate::executor::GatedSingleTaskExecutor;
use crate::supervisor::{ProcessSupervisor, SupervisorState};
use crate::task::OfficeTask;

struct WorkerShared {
    settings: Arc<ProcessSettings>,
    supervisor: Arc<ProcessSupervisor>,
    executor: GatedSingleTaskExecutor,
    task_count: AtomicU32,
    /// The next disconnect was asked for and is not a lost connection
    stopping: AtomicBool,
    /// Tasks hold it shared from counting until they finish; the
    /// task-count restart holds it exclusively
    run_lock: RwLock<()>,
}

/// Runs tasks against one supervised converter.
///
/// Tasks run one at a time and only while connected. After
/// `tasks_count_for_process_restart` tasks the converter is restarted
/// before the next one starts; a lost connection restarts it as well.
#[derive(Clone)]
pub struct OfficeWorker {
    shared: Arc<WorkerShared>,
}

impl OfficeWorker {
    pub fn new(settings: Arc<ProcessSettings>, supervisor: Arc<ProcessSupervisor>) -> Self {
        let executor = GatedSingleTaskExecutor::new(settings.task_queue_timeout, supervisor.clone());
        let shared = Arc::new(WorkerShared {
            settings,
            supervisor: supervisor.clone(),
            executor,
            task_count: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            run_lock: RwLock::new(()),
        });

        supervisor.connection().add_listener(Arc::new(WorkerListener {
            shared: Arc::downgrade(&shared),
        }));

        Self { shared }
    }

    /// Worker for a real converter process on `endpoint`
    pub fn for_endpoint(settings: Arc<ProcessSettings>, endpoint: EndpointAddress) -> Self {
        let supervisor = ProcessSupervisor::for_endpoint(settings.clone(), endpoint);
        Self::new(settings, supervisor)
    }

    pub fn endpoint(&self) -> &EndpointAddress {
        self.shared.supervisor.endpoint()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.shared.supervisor
    }

    /// Tasks accepted since the last (re)connect
    pub fn task_count(&self) -> u32 {
        self.shared.task_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.supervisor.state() != SupervisorState::Stopped
    }

    /// Start the converter and open for tasks
    pub async fn start(&self) -> SupervisorResult<()> {
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.supervisor.start_and_wait().await
    }

    /// Stop accepting tasks and stop the converter
    pub async fn shutdown(&self) -> SupervisorResult<()> {
        info!(port = self.endpoint().port(), "Shutting down worker");
        self.shared.executor.set_available(false);
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.executor.shutdown();
        self.shared.supervisor.stop_and_wait().await
    }

    /// Run `task` within `task_execution_timeout`.
    ///
    /// The task's own error comes back as [`ExecutionError::TaskFailed`]
    /// and can be recovered with [`ExecutionError::into_task_error`].
    pub async fn execute<T: OfficeTask>(&self, task: T) -> ExecutionResult<T::Output> {
        let _running = self.count_task().await?;

        let connection = self.shared.supervisor.connection().clone();
        self.shared
            .executor
            .execute(
                move || async move {
                    task.execute(&connection)
                        .await
                        .map_err(|e| Box::new(e) as TaskError)
                },
                self.shared.settings.task_execution_timeout,
            )
            .await
    }

    /// Count the task, restarting the converter first if the limit was
    /// reached. The restart waits until no other task is in flight.
    async fn count_task(&self) -> ExecutionResult<RwLockReadGuard<'_, ()>> {
        let shared = &self.shared;
        let limit = shared.settings.tasks_count_for_process_restart;

        let running = shared.run_lock.read().await;
        if limit == 0 {
            shared.task_count.fetch_add(1, Ordering::SeqCst);
            return Ok(running);
        }
        let counted = shared
            .task_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < limit).then_some(count + 1)
            });
        if counted.is_ok() {
            return Ok(running);
        }
        drop(running);

        let exclusive = shared.run_lock.write().await;
        if shared.task_count.load(Ordering::SeqCst) >= limit {
            info!(port = self.endpoint().port(), limit, "Task limit reached, restarting converter");
            shared.executor.set_available(false);
            shared.stopping.store(true, Ordering::SeqCst);
            shared.supervisor.restart_and_wait().await.map_err(|e| {
                ExecutionError::Unavailable(format!("restart after {} tasks failed: {}", limit, e))
            })?;
            shared.task_count.store(0, Ordering::SeqCst);
        }

        shared.task_count.fetch_add(1, Ordering::SeqCst);
        Ok(exclusive.downgrade())
    }
}

struct WorkerListener {
    shared: Weak<WorkerShared>,
}

impl ConnectionListener for WorkerListener {
    fn on_connected(&self, event: &ConnectionEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!(port = event.endpoint.port(), "Worker available");
        shared.task_count.store(0, Ordering::SeqCst);
        shared.stopping.store(false, Ordering::SeqCst);
        shared.executor.set_available(true);
    }

    fn on_disconnected(&self, event: &ConnectionEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.executor.set_available(false);
        if shared.stopping.swap(false, Ordering::SeqCst) {
            debug!(port = event.endpoint.port(), "Worker disconnected on request");
            return;
        }

        warn!(port = event.endpoint.port(), bridge = %event.bridge_name, "Connection lost");
        shared.executor.cancel_current();
        shared.supervisor.restart_due_to_lost_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskCancelled;
    use crate::testing::{fast_settings, FakeProcess, FakeProcessProbe};
    use async_trait::async_trait;
    use officevisor_bridge::testing::FakeConnector;
    use officevisor_bridge::{BridgeError, Connection, DESKTOP_SERVICE};
    use serde_json::{json, Value as JsonValue};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Calls `method` on the desktop service
    struct Call(&'static str);

    #[async_trait]
    impl OfficeTask for Call {
        type Output = JsonValue;
        type Error = BridgeError;

        async fn execute(&self, connection: &Arc<Connection>) -> Result<JsonValue, BridgeError> {
            connection
                .invoke(DESKTOP_SERVICE, self.0, json!({ "method": self.0 }))
                .await
        }
    }

    /// Reports how many times the process had been started when it ran
    struct CountStarts(Arc<FakeProcessProbe>);

    #[async_trait]
    impl OfficeTask for CountStarts {
        type Output = usize;
        type Error = BridgeError;

        async fn execute(&self, _connection: &Arc<Connection>) -> Result<usize, BridgeError> {
            Ok(self.0.starts())
        }
    }

    struct Harness {
        worker: OfficeWorker,
        probe: Arc<FakeProcessProbe>,
        connector: Arc<FakeConnector>,
        _work_dir: TempDir,
    }

    fn harness(configure: impl FnOnce(&mut ProcessSettings)) -> Harness {
        let work_dir = TempDir::new().unwrap();
        let mut settings = fast_settings(work_dir.path());
        configure(&mut settings);
        let settings = Arc::new(settings);

        let probe = FakeProcessProbe::new();
        let connector = FakeConnector::new();
        let process = FakeProcess::new(probe.clone(), connector.clone());
        let connection = Connection::new(EndpointAddress::local(2002), connector.clone());
        let supervisor = ProcessSupervisor::new(settings.clone(), Box::new(process), connection);

        Harness {
            worker: OfficeWorker::new(settings, supervisor),
            probe,
            connector,
            _work_dir: work_dir,
        }
    }

    async fn wait_connected(worker: &OfficeWorker) {
        let mut states = worker.supervisor().subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == SupervisorState::Connected),
        )
        .await
        .expect("worker did not reconnect")
        .unwrap();
    }

    #[tokio::test]
    async fn test_execute_runs_task() {
        let h = harness(|_| {});
        h.worker.start().await.unwrap();

        let output = h.worker.execute(Call("echo")).await.unwrap();

        assert_eq!(output, json!({ "method": "echo" }));
        assert_eq!(h.worker.task_count(), 1);
        assert!(h.worker.is_running());
    }

    #[tokio::test]
    async fn test_task_submitted_before_start_runs_after_connect() {
        let h = harness(|_| {});
        let worker = h.worker.clone();
        let pending = tokio::spawn(async move { worker.execute(Call("echo")).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pending.is_finished());

        h.worker.start().await.unwrap();
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_restart_after_task_limit() {
        let h = harness(|settings| settings.tasks_count_for_process_restart = 3);
        h.worker.start().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(h.worker.execute(CountStarts(h.probe.clone())).await.unwrap());
        }

        assert_eq!(seen, vec![1, 1, 1, 2]);
        assert_eq!(h.probe.starts(), 2);
        assert_eq!(h.worker.task_count(), 1);
        // Deliberate restart: stopped gracefully, not killed
        assert_eq!(h.connector.terminate_calls(), 1);
        assert_eq!(h.probe.force_kills(), 0);
    }

    /// Records the start count before and after a pause
    struct StartsAcrossPause(Arc<FakeProcessProbe>);

    #[async_trait]
    impl OfficeTask for StartsAcrossPause {
        type Output = (usize, usize);
        type Error = BridgeError;

        async fn execute(&self, connection: &Arc<Connection>) -> Result<(usize, usize), BridgeError> {
            let before = self.0.starts();
            connection.invoke(DESKTOP_SERVICE, "echo", json!(null)).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok((before, self.0.starts()))
        }
    }

    #[tokio::test]
    async fn test_task_limit_restart_waits_for_running_task() {
        let h = harness(|settings| settings.tasks_count_for_process_restart = 1);
        h.worker.start().await.unwrap();

        let worker = h.worker.clone();
        let probe = h.probe.clone();
        let first = tokio::spawn(async move { worker.execute(StartsAcrossPause(probe)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = h.worker.execute(CountStarts(h.probe.clone())).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first, (1, 1), "converter restarted under a running task");
        assert_eq!(second, 2);
        assert_eq!(h.connector.terminate_calls(), 1);
        assert_eq!(h.probe.force_kills(), 0);
    }

    #[tokio::test]
    async fn test_timeout_restarts_process() {
        let h = harness(|settings| settings.task_execution_timeout = Duration::from_millis(100));
        h.worker.start().await.unwrap();

        let error = h.worker.execute(Call("hang")).await.unwrap_err();
        assert!(error.is_timeout());

        tokio::time::sleep(Duration::from_millis(50)).await;
        wait_connected(&h.worker).await;
        assert_eq!(h.probe.force_kills(), 1);
        assert_eq!(h.probe.starts(), 2);

        let output = h.worker.execute(Call("echo")).await.unwrap();
        assert_eq!(output["method"], "echo");
    }

    #[tokio::test]
    async fn test_lost_connection_cancels_and_restarts() {
        let h = harness(|_| {});
        h.worker.start().await.unwrap();

        let worker = h.worker.clone();
        let running = tokio::spawn(async move { worker.execute(Call("hang")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.connector.drop_bridges();

        let error = running.await.unwrap().unwrap_err();
        assert!(error.task_error::<TaskCancelled>().is_some());

        wait_connected(&h.worker).await;
        assert_eq!(h.probe.starts(), 2);
        assert!(h.worker.execute(Call("echo")).await.is_ok());
    }

    #[tokio::test]
    async fn test_task_error_is_returned() {
        let h = harness(|_| {});
        h.worker.start().await.unwrap();

        let error = h.worker.execute(Call("fail")).await.unwrap_err();

        let bridge_error = error.into_task_error::<BridgeError>().unwrap();
        assert!(matches!(bridge_error, BridgeError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_is_not_a_lost_connection() {
        let h = harness(|_| {});
        h.worker.start().await.unwrap();

        h.worker.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!h.worker.is_running());
        assert_eq!(h.probe.starts(), 1);
        assert_eq!(h.connector.terminate_calls(), 1);
        assert!(matches!(
            h.worker.execute(Call("echo")).await,
            Err(ExecutionError::Unavailable(_))
        ));
    }
}
