//! ABOUTME: Applies bus events to the local scheduler and task runner
//! ABOUTME: Follower replicas act only on timer cancels and reloads

use crate::runner::TaskRunner;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use cf_bus::{BusEvent, EventEnvelope, EventHandler};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bridges the event bus into the engine on this replica.
pub struct EngineEventHandler {
    scheduler: Arc<Scheduler>,
    runner: Arc<TaskRunner>,
}

impl EngineEventHandler {
    pub fn new(scheduler: Arc<Scheduler>, runner: Arc<TaskRunner>) -> Arc<Self> {
        Arc::new(Self { scheduler, runner })
    }
}

#[async_trait]
impl EventHandler for EngineEventHandler {
    async fn handle(&self, envelope: EventEnvelope) {
        match envelope.event {
            BusEvent::SubmitTask {
                task_id,
                parameters,
            } => {
                // Only the leader creates executions; other replicas see the
                // same event and drop it.
                if !self.scheduler.is_leader() {
                    debug!(task_id = %task_id, source = %envelope.source, "Follower ignoring submit event");
                    return;
                }
                if let Err(e) = self.scheduler.submit_new_task(&task_id, parameters).await {
                    warn!(task_id = %task_id, "Submit event failed: {}", e);
                }
            }
            BusEvent::ReloadTasks => {
                self.scheduler.reload().await;
            }
            BusEvent::CancelExecutionTimer { execution_id } => {
                // Whichever replica armed the timer owns it; cancel is a
                // no-op everywhere else.
                self.runner.cancel_timeout(&execution_id);
            }
        }
    }
}
