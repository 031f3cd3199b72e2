//! ABOUTME: Bounded worker pool owning the dispatch lifecycle per execution
//! ABOUTME: Retry with capped backoff, breaker-guarded calls, timeout timers

use crate::balance::LoadBalancer;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::client::{dispatch_timeout, ExecutePayload, ExecutorClient};
use cf_core::{Error, Result};
use cf_db::{Db, Execution, ExecutionRepository, ExecutionStatus, ExecutorRepository, Task};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff before retry attempt N (N >= 1): 2^(N-1) seconds, capped at 30.
pub fn backoff_delay(attempt: u32) -> Duration {
    debug_assert!(attempt >= 1);
    let secs = 1u64 << (attempt.saturating_sub(1)).min(6);
    Duration::from_secs(secs.min(30))
}

/// One-shot timers keyed by execution id. Arming again for the same id
/// replaces the previous timer.
#[derive(Clone, Default)]
pub struct TimeoutTimers {
    map: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TimeoutTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a timer; on fire the timer removes itself and runs `on_fire`.
    pub fn arm<F>(&self, execution_id: &str, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = execution_id.to_string();
        let map = self.map.clone();

        let handle = tokio::spawn({
            let id = id.clone();
            let map = map.clone();
            async move {
                tokio::time::sleep(delay).await;
                map.lock().unwrap().remove(&id);
                on_fire.await;
            }
        });

        if let Some(previous) = self.map.lock().unwrap().insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop and remove the timer if present
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.map.lock().unwrap().remove(execution_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every outstanding timer
    pub fn abort_all(&self) {
        let mut map = self.map.lock().unwrap();
        for (_, handle) in map.drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Task runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker pool size; the job queue holds twice this many entries
    pub workers: usize,
    /// Base URL for executor callbacks
    pub callback_base: String,
}

/// One unit of dispatch work
struct DispatchJob {
    task: Task,
    execution: Execution,
}

/// Everything a worker needs to run one job; cloned into each worker task.
#[derive(Clone)]
struct Dispatcher {
    db: Db,
    client: ExecutorClient,
    balancer: Arc<LoadBalancer>,
    breakers: Arc<BreakerRegistry>,
    timers: TimeoutTimers,
    config: RunnerConfig,
}

impl Dispatcher {
    async fn run_job(&self, job: DispatchJob) {
        let DispatchJob { task, execution } = job;
        let executions = ExecutionRepository::new(self.db.pool());

        match executions.mark_running(&execution.id).await {
            Ok(true) => {}
            Ok(false) => {
                // Already past pending (e.g. cancelled while queued)
                debug!(execution = %execution.id, "Skipping job no longer pending");
                return;
            }
            Err(e) => {
                warn!(execution = %execution.id, "Failed to mark running: {}", e);
                return;
            }
        }

        let max_retry = task.max_retry.max(0) as u32;
        let mut last_error = "no dispatch attempted".to_string();

        for attempt in 0..=max_retry {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let candidates = match ExecutorRepository::new(self.db.pool())
                .find_candidates(&task.id)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            if candidates.is_empty() {
                last_error = "no healthy executors available".to_string();
                debug!(task = %task.name, attempt = attempt, "{}", last_error);
                continue;
            }

            let selected = match self.balancer.select(&task, &candidates).await {
                Ok(executor) => executor,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            if let Err(e) = executions
                .assign_executor(&execution.id, &selected.id, attempt as i32)
                .await
            {
                last_error = e.to_string();
                continue;
            }

            let breaker = self.breakers.get_or_create(&selected.id);
            if !breaker.try_acquire() {
                last_error = Error::CircuitOpen(selected.instance_id.clone()).to_string();
                debug!(task = %task.name, executor = %selected.instance_id, "{}", last_error);
                continue;
            }

            let payload = ExecutePayload {
                execution_id: execution.id.clone(),
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                parameters: task.parameters.clone(),
                callback_url: format!(
                    "{}/api/executions/{}/callback",
                    self.config.callback_base, execution.id
                ),
            };
            let timeout = dispatch_timeout(task.timeout_seconds);

            match self.client.execute(&selected, &payload, timeout).await {
                Ok(()) => {
                    breaker.record_success();
                    if task.timeout_seconds > 0 {
                        self.arm_execution_timeout(&execution.id, task.timeout_seconds);
                    }
                    info!(
                        task = %task.name,
                        execution = %execution.id,
                        executor = %selected.instance_id,
                        attempt = attempt,
                        "Execution dispatched, awaiting callback"
                    );
                    return;
                }
                Err(e) => {
                    breaker.record_failure();
                    last_error = e.to_string();
                    debug!(task = %task.name, attempt = attempt, "Dispatch attempt failed: {}", last_error);
                }
            }
        }

        let log = format!("failed after {} attempts: {}", max_retry + 1, last_error);
        warn!(task = %task.name, execution = %execution.id, "{}", log);
        if let Err(e) = executions
            .finalize(&execution.id, ExecutionStatus::Failed, None, &log)
            .await
        {
            warn!(execution = %execution.id, "Failed to finalize execution: {}", e);
        }
    }

    /// Arm the awaiting-callback timeout. On fire the execution is reloaded;
    /// the terminal guard makes this a no-op when the callback won the race.
    fn arm_execution_timeout(&self, execution_id: &str, timeout_seconds: i32) {
        let db = self.db.clone();
        let id = execution_id.to_string();
        self.timers.arm(
            execution_id,
            Duration::from_secs(timeout_seconds.max(1) as u64),
            async move {
                let executions = ExecutionRepository::new(db.pool());
                match executions.find_by_id(&id).await {
                    Ok(Some(execution)) if execution.status == ExecutionStatus::Running => {
                        match executions
                            .finalize(&id, ExecutionStatus::Timeout, None, "execution timeout")
                            .await
                        {
                            Ok(true) => warn!(execution = %id, "Execution timed out"),
                            Ok(false) => {}
                            Err(e) => warn!(execution = %id, "Failed to time out execution: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(execution = %id, "Timeout reload failed: {}", e),
                }
            },
        );
    }
}

/// Bounded worker pool that owns the full dispatch lifecycle of an
/// execution: selection, HTTP dispatch, retry, timeout timer, terminal
/// transition.
pub struct TaskRunner {
    dispatcher: Dispatcher,
    tx: mpsc::Sender<DispatchJob>,
    rx: Mutex<Option<mpsc::Receiver<DispatchJob>>>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl TaskRunner {
    pub fn new(db: Db, config: RunnerConfig) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(workers * 2);
        Self {
            dispatcher: Dispatcher {
                client: ExecutorClient::new(),
                balancer: Arc::new(LoadBalancer::new(db.clone())),
                breakers: Arc::new(BreakerRegistry::new(BreakerConfig::default())),
                timers: TimeoutTimers::new(),
                config,
                db,
            },
            tx,
            rx: Mutex::new(Some(rx)),
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            workers,
        }
    }

    /// Spawn the worker pool. Calling start twice is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().unwrap().take() else {
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self.handles.lock().unwrap();
        for worker in 0..self.workers {
            let dispatcher = self.dispatcher.clone();
            let token = self.token.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(worker_loop(dispatcher, rx, token, worker)));
        }
        info!(workers = self.workers, "Task runner started");
    }

    /// Non-blocking enqueue. A full queue immediately finalizes the
    /// execution as failed; nothing is silently dropped.
    pub async fn submit(&self, task: Task, execution: Execution) -> Result<()> {
        let execution_id = execution.id.clone();
        match self.tx.try_send(DispatchJob { task, execution }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(execution = %execution_id, "Dispatch queue full, failing execution");
                ExecutionRepository::new(self.dispatcher.db.pool())
                    .finalize(&execution_id, ExecutionStatus::Failed, None, "queue full")
                    .await?;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Dispatch("Task runner is stopped".to_string()))
            }
        }
    }

    /// Stop and drop the timeout timer for an execution, if this replica
    /// owns one.
    pub fn cancel_timeout(&self, execution_id: &str) {
        if self.dispatcher.timers.cancel(execution_id) {
            debug!(execution = %execution_id, "Cancelled timeout timer");
        }
    }

    /// Health checker hook: executor went offline
    pub fn remove_breaker(&self, executor_id: &str) {
        self.dispatcher.breakers.remove(executor_id);
    }

    /// Health checker hook: executor recovered
    pub fn reset_breaker(&self, executor_id: &str) {
        self.dispatcher.breakers.reset(executor_id);
    }

    /// Cancel workers, wait for the in-flight jobs, stop all timers.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        self.dispatcher.timers.abort_all();
        info!("Task runner stopped");
    }
}

async fn worker_loop(
    dispatcher: Dispatcher,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchJob>>>,
    token: CancellationToken,
    worker: usize,
) {
    loop {
        let job = {
            let mut receiver = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => return,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else { return };
        debug!(worker = worker, execution = %job.execution.id, "Worker picked up job");
        dispatcher.run_job(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_delays() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        // Capped at 30 seconds from the sixth retry on
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(7), Duration::from_secs(30));
        assert_eq!(backoff_delay(100), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_removes_itself() {
        let timers = TimeoutTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.arm("x-1", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let timers = TimeoutTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.arm("x-1", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.cancel("x-1"));
        assert!(!timers.cancel("x-1"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_previous_timer() {
        let timers = TimeoutTimers::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        timers.arm("x-1", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        timers.arm("x-1", Duration::from_secs(10), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0, "replaced timer must not fire");
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_clears_timers() {
        let timers = TimeoutTimers::new();
        for i in 0..4 {
            timers.arm(&format!("x-{}", i), Duration::from_secs(30), async {});
        }
        assert_eq!(timers.len(), 4);
        timers.abort_all();
        assert!(timers.is_empty());
    }
}
