//! Gated single-task executor

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ExecutionError, ExecutionResult, TaskCancelled, TaskError};
use crate::gate::Gate;

/// Told when a task overran its budget
pub trait TimeoutHandler: Send + Sync {
    fn on_task_timeout(&self);
}

struct Job {
    id: u64,
    run: BoxFuture<'static, ()>,
}

struct RunningJob {
    id: u64,
    cancel: oneshot::Sender<()>,
}

/// Runs at most one task at a time, and only while the gate is open.
///
/// Submissions go through a capacity-1 queue; the runner takes a job and
/// then waits for the gate before starting it, so work submitted while
/// disconnected drains once the gate reopens.
pub struct GatedSingleTaskExecutor {
    gate: Gate,
    queue: mpsc::Sender<Job>,
    queue_timeout: Duration,
    next_id: AtomicU64,
    current: Arc<Mutex<Option<RunningJob>>>,
    timeout_handler: Arc<dyn TimeoutHandler>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl GatedSingleTaskExecutor {
    /// Create an executor with a closed gate
    pub fn new(queue_timeout: Duration, timeout_handler: Arc<dyn TimeoutHandler>) -> Self {
        let gate = Gate::new();
        let (queue, jobs) = mpsc::channel(1);
        let current = Arc::new(Mutex::new(None));
        let runner = tokio::spawn(run_jobs(jobs, gate.clone(), current.clone()));

        Self {
            gate,
            queue,
            queue_timeout,
            next_id: AtomicU64::new(0),
            current,
            timeout_handler,
            runner: Mutex::new(Some(runner)),
        }
    }

    pub fn set_available(&self, available: bool) {
        if available {
            self.gate.open();
        } else {
            self.gate.close();
        }
    }

    pub fn is_available(&self) -> bool {
        self.gate.is_open()
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Run `task` and wait for its result.
    ///
    /// `timeout` counts from submission. On expiry the task is cancelled,
    /// the timeout handler is told, and [`ExecutionError::TaskTimeout`] is
    /// returned.
    pub async fn execute<F, Fut, T>(&self, task: F, timeout: Duration) -> ExecutionResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (result_tx, result_rx) = oneshot::channel();

        let run = Box::pin(async move {
            if result_tx.is_closed() {
                trace!(task = id, "Skipping abandoned task");
                return;
            }
            let _ = result_tx.send(task().await);
        });

        match tokio::time::timeout(self.queue_timeout, self.queue.send(Job { id, run })).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(ExecutionError::Unavailable(
                    "executor has shut down".to_string(),
                ))
            }
            Err(_) => {
                return Err(ExecutionError::Unavailable(format!(
                    "no free slot within {:?}",
                    self.queue_timeout
                )))
            }
        }

        match tokio::time::timeout_at(deadline, result_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(ExecutionError::TaskFailed(error)),
            Ok(Err(_)) => Err(ExecutionError::TaskFailed(Box::new(TaskCancelled::new(
                "cancelled before completion",
            )))),
            Err(_) => {
                warn!(task = id, ?timeout, "Task timed out");
                self.cancel(id);
                self.timeout_handler.on_task_timeout();
                Err(ExecutionError::TaskTimeout { timeout })
            }
        }
    }

    /// Cancel the running task, if any
    pub fn cancel_current(&self) {
        if let Some(running) = self.current.lock().take() {
            debug!(task = running.id, "Cancelling running task");
            let _ = running.cancel.send(());
        }
    }

    fn cancel(&self, id: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|running| running.id == id) {
            if let Some(running) = current.take() {
                let _ = running.cancel.send(());
            }
        }
    }

    /// Stop for good: close the gate and drop running and queued work
    pub fn shutdown(&self) {
        self.gate.shut_down();
        self.cancel_current();
        if let Some(runner) = self.runner.lock().take() {
            runner.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.runner.lock().is_none()
    }
}

impl Drop for GatedSingleTaskExecutor {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.lock().take() {
            runner.abort();
        }
    }
}

async fn run_jobs(
    mut jobs: mpsc::Receiver<Job>,
    gate: Gate,
    current: Arc<Mutex<Option<RunningJob>>>,
) {
    while let Some(job) = jobs.recv().await {
        if gate.wait_open().await.is_err() {
            break;
        }

        let (cancel, cancelled) = oneshot::channel();
        *current.lock() = Some(RunningJob { id: job.id, cancel });

        tokio::select! {
            _ = job.run => trace!(task = job.id, "Task finished"),
            _ = cancelled => debug!(task = job.id, "Task cancelled"),
        }

        let mut current = current.lock();
        if current.as_ref().is_some_and(|running| running.id == job.id) {
            current.take();
        }
    }
}
