//! ABOUTME: Top-level orchestrator: leader election and cron ownership
//! ABOUTME: Applies execution-mode policy and feeds the task runner

use crate::cron::{CronCallback, CronEngine};
use crate::runner::TaskRunner;
use cf_core::{Error, Result};
use cf_db::leader::AcquireOutcome;
use cf_db::{
    Db, Execution, ExecutionMode, ExecutionRepository, InstanceRepository, LeaderLock, Task,
    TaskRepository, TaskStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with one firing of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Create a pending execution and dispatch it
    Proceed,
    /// Drop the firing without a trace (sequential mode)
    SkipSilently,
    /// Persist a terminal skipped execution for audit (skip mode)
    RecordSkipped,
}

/// Execution-mode arbitration over the count of in-flight executions
pub fn decide_execution(mode: ExecutionMode, active_count: i64) -> ScheduleDecision {
    match mode {
        ExecutionMode::Parallel => ScheduleDecision::Proceed,
        ExecutionMode::Sequential => {
            if active_count == 0 {
                ScheduleDecision::Proceed
            } else {
                ScheduleDecision::SkipSilently
            }
        }
        ExecutionMode::Skip => {
            if active_count > 0 {
                ScheduleDecision::RecordSkipped
            } else {
                ScheduleDecision::Proceed
            }
        }
    }
}

/// Shallow-merge trigger parameters over the task's own parameter object.
/// Non-object overrides replace the parameters wholesale.
pub fn merge_parameters(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
            serde_json::Value::Object(base)
        }
        (base, serde_json::Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Apply execution-mode policy for one firing and, when proceeding, persist
/// a pending execution and hand it to the runner. Shared by cron callbacks
/// and manual triggers.
pub async fn schedule_task(db: &Db, runner: &TaskRunner, task: Task) -> Result<Option<Execution>> {
    let executions = ExecutionRepository::new(db.pool());
    let active = executions.count_active(&task.id).await?;

    match decide_execution(task.execution_mode, active) {
        ScheduleDecision::SkipSilently => {
            debug!(task = %task.name, in_flight = active, "Sequential task busy, dropping firing");
            Ok(None)
        }
        ScheduleDecision::RecordSkipped => {
            let execution = executions
                .create_skipped(&task.id, "skipped due to execution mode")
                .await?;
            info!(task = %task.name, execution = %execution.id, "Recorded skipped execution");
            Ok(Some(execution))
        }
        ScheduleDecision::Proceed => {
            let execution = executions.create_pending(&task.id).await?;
            debug!(task = %task.name, execution = %execution.id, "Execution created");
            runner.submit(task, execution.clone()).await?;
            Ok(Some(execution))
        }
    }
}

/// One cron firing: reload the task so pauses and edits between reloads are
/// honored, then schedule.
async fn fire_task(db: &Db, runner: &TaskRunner, task_id: &str) -> Result<()> {
    let task = TaskRepository::new(db.pool()).find_by_id(task_id).await?;
    let Some(task) = task else {
        debug!(task_id = %task_id, "Task vanished, skipping firing");
        return Ok(());
    };
    if task.status != TaskStatus::Active {
        debug!(task = %task.name, "Task no longer active, skipping firing");
        return Ok(());
    }
    schedule_task(db, runner, task).await?;
    Ok(())
}

/// Scheduler options mapped from configuration
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub instance_id: String,
    pub lock_key: String,
    pub lock_timeout: Duration,
    pub heartbeat: Duration,
    pub host: String,
    pub port: u16,
}

/// Top-level orchestrator. Registers the replica, runs the leader-election
/// loop, owns the cron engine, and submits fired executions to the runner.
///
/// Cheap to clone; clones share all election and cron state.
#[derive(Clone)]
pub struct Scheduler {
    db: Db,
    cron: Arc<CronEngine>,
    runner: Arc<TaskRunner>,
    options: SchedulerOptions,
    is_leader: Arc<AtomicBool>,
    lock: Arc<tokio::sync::Mutex<Option<LeaderLock>>>,
    token: CancellationToken,
    election: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(db: Db, runner: Arc<TaskRunner>, options: SchedulerOptions) -> Self {
        Self {
            db,
            cron: Arc::new(CronEngine::new()),
            runner,
            options,
            is_leader: Arc::new(AtomicBool::new(false)),
            lock: Arc::new(tokio::sync::Mutex::new(None)),
            token: CancellationToken::new(),
            election: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    /// Register this replica and begin the election loop.
    pub async fn start(&self) -> Result<()> {
        InstanceRepository::new(self.db.pool())
            .upsert(
                &self.options.instance_id,
                &self.options.host,
                self.options.port,
            )
            .await?;
        info!(
            instance = %self.options.instance_id,
            heartbeat_secs = self.options.heartbeat.as_secs(),
            "Scheduler instance registered"
        );

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.options.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                scheduler.election_tick().await;
            }
            debug!("Election loop exited");
        });
        *self.election.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn election_tick(&self) {
        if self.is_leader() {
            self.renew_or_demote().await;
        } else {
            self.try_promote().await;
        }
    }

    async fn try_promote(&self) {
        let mut slot = self.lock.lock().await;
        if slot.is_none() {
            match LeaderLock::connect(self.db.pool(), &self.options.lock_key).await {
                Ok(lock) => *slot = Some(lock),
                Err(e) => {
                    debug!("Leader lock session unavailable: {}", e);
                    return;
                }
            }
        }

        let outcome = match slot.as_mut() {
            Some(lock) => lock.try_acquire(self.options.lock_timeout).await,
            None => return,
        };

        match outcome {
            Ok(AcquireOutcome::Held) => {
                drop(slot);
                self.is_leader.store(true, Ordering::SeqCst);
                self.update_leader_row(true).await;
                info!(instance = %self.options.instance_id, "Became leader");

                if let Err(e) = self.reload_tasks().await {
                    warn!("Task reload after promotion failed: {}", e);
                }
                self.cron.start().await;
            }
            Ok(AcquireOutcome::NotHeld) => {
                debug!("Leader lock held elsewhere, staying follower");
            }
            Err(e) => {
                warn!("Leader lock acquisition errored: {}", e);
                // Session may be broken; rebuild it on the next tick
                *slot = None;
            }
        }
    }

    async fn renew_or_demote(&self) {
        let still_held = {
            let mut slot = self.lock.lock().await;
            match slot.as_mut() {
                Some(lock) => match lock.renew().await {
                    Ok(held) => held,
                    Err(e) => {
                        warn!("Leader lock renewal errored: {}", e);
                        false
                    }
                },
                None => false,
            }
        };

        if still_held {
            self.update_leader_row(true).await;
            return;
        }

        warn!(instance = %self.options.instance_id, "Leadership lost, demoting to follower");
        self.is_leader.store(false, Ordering::SeqCst);
        self.cron.stop().await;
        self.cron.remove_all().await;
        self.update_leader_row(false).await;
        // The lock session is gone; a fresh one is built on the next attempt
        *self.lock.lock().await = None;
    }

    async fn update_leader_row(&self, is_leader: bool) {
        if let Err(e) = InstanceRepository::new(self.db.pool())
            .set_leader(&self.options.instance_id, is_leader)
            .await
        {
            warn!("Failed to update leader row: {}", e);
        }
    }

    /// Rebuild the cron table from all active tasks.
    pub async fn reload_tasks(&self) -> Result<usize> {
        self.cron.remove_all().await;

        let tasks = TaskRepository::new(self.db.pool()).list_active().await?;
        let mut registered = 0usize;
        for task in tasks {
            let expr = task.cron_expr.clone();
            match self.cron.add(&expr, self.cron_callback(&task.id)).await {
                Ok(()) => registered += 1,
                Err(e) => warn!(task = %task.name, "Skipping task with bad cron: {}", e),
            }
        }
        info!(tasks = registered, "Cron table reloaded");
        Ok(registered)
    }

    fn cron_callback(&self, task_id: &str) -> CronCallback {
        let db = self.db.clone();
        let runner = self.runner.clone();
        let task_id = task_id.to_string();
        Arc::new(move || {
            let db = db.clone();
            let runner = runner.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                if let Err(e) = fire_task(&db, &runner, &task_id).await {
                    warn!(task_id = %task_id, "Cron firing failed: {}", e);
                }
            })
        })
    }

    /// Apply execution-mode policy and, when proceeding, dispatch.
    pub async fn schedule(&self, task: Task) -> Result<Option<Execution>> {
        schedule_task(&self.db, &self.runner, task).await
    }

    /// Manual trigger. Followers answer with the distinguished not-leader
    /// signal so the caller can forward over the bus or report back. Returns
    /// None when execution-mode policy dropped the firing.
    pub async fn submit_new_task(
        &self,
        task_id: &str,
        parameters: serde_json::Value,
    ) -> Result<Option<Execution>> {
        if !self.is_leader() {
            return Err(Error::NotLeader(self.options.instance_id.clone()));
        }

        let task = TaskRepository::new(self.db.pool())
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
        if task.status != TaskStatus::Active {
            return Err(Error::Validation(format!(
                "Task {} is not active",
                task.name
            )));
        }

        let mut task = task;
        task.parameters = merge_parameters(task.parameters, parameters);
        self.schedule(task).await
    }

    /// Bus-facing reload: a no-op on followers.
    pub async fn reload(&self) {
        if !self.is_leader() {
            debug!("Reload event ignored on follower");
            return;
        }
        if let Err(e) = self.reload_tasks().await {
            warn!("Task reload failed: {}", e);
        }
    }

    /// Stop the election loop, the cron engine, and release leadership.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.election.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.cron.stop().await;
        self.cron.remove_all().await;

        if self.is_leader() {
            self.is_leader.store(false, Ordering::SeqCst);
            if let Some(lock) = self.lock.lock().await.as_mut() {
                if let Err(e) = lock.release().await {
                    warn!("Failed to release leader lock on shutdown: {}", e);
                }
            }
            self.update_leader_row(false).await;
        }
        info!(instance = %self.options.instance_id, "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parallel_always_proceeds() {
        assert_eq!(
            decide_execution(ExecutionMode::Parallel, 0),
            ScheduleDecision::Proceed
        );
        assert_eq!(
            decide_execution(ExecutionMode::Parallel, 12),
            ScheduleDecision::Proceed
        );
    }

    #[test]
    fn test_sequential_blocks_while_in_flight() {
        assert_eq!(
            decide_execution(ExecutionMode::Sequential, 0),
            ScheduleDecision::Proceed
        );
        assert_eq!(
            decide_execution(ExecutionMode::Sequential, 1),
            ScheduleDecision::SkipSilently
        );
    }

    #[test]
    fn test_skip_mode_records_a_row() {
        assert_eq!(
            decide_execution(ExecutionMode::Skip, 0),
            ScheduleDecision::Proceed
        );
        assert_eq!(
            decide_execution(ExecutionMode::Skip, 2),
            ScheduleDecision::RecordSkipped
        );
    }

    #[test]
    fn test_merge_parameters_shallow_merges_objects() {
        let base = json!({"a": 1, "b": 2});
        let overlay = json!({"b": 3, "c": 4});
        assert_eq!(
            merge_parameters(base, overlay),
            json!({"a": 1, "b": 3, "c": 4})
        );
    }

    #[test]
    fn test_merge_parameters_null_keeps_base() {
        let base = json!({"a": 1});
        assert_eq!(merge_parameters(base.clone(), json!(null)), base);
    }

    #[test]
    fn test_merge_parameters_non_object_replaces() {
        let base = json!({"a": 1});
        assert_eq!(merge_parameters(base, json!([1, 2])), json!([1, 2]));
    }
}
