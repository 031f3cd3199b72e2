//! ABOUTME: Periodic executor health probing and the online/offline machine
//! ABOUTME: Probes run bounded-parallel; DB writes are minimal patches

use crate::client::ExecutorClient;
use crate::runner::TaskRunner;
use cf_core::time::utc_now;
use cf_db::{Db, Executor, ExecutorPatch, ExecutorRepository, ExecutorStatus};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub enabled: bool,
    /// Probe loop interval
    pub interval: Duration,
    /// Per-probe request timeout (clamped to 1..=5 seconds at use)
    pub timeout: Duration,
    /// Consecutive failures before an executor goes offline
    pub failure_threshold: i32,
    /// Consecutive successes before an unhealthy executor recovers
    pub recovery_threshold: i32,
    /// Bound on parallel probes
    pub max_concurrency: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
            recovery_threshold: 2,
            max_concurrency: (cpus * 4).min(32),
        }
    }
}

/// Clamp the probe timeout into the allowed window
pub fn probe_timeout(configured: Duration) -> Duration {
    Duration::from_secs(configured.as_secs().clamp(1, 5))
}

/// Executor fields the probe decision reads
#[derive(Debug, Clone, Copy)]
pub struct ProbeView {
    pub is_healthy: bool,
    pub status: ExecutorStatus,
    pub failure_count: i32,
}

impl From<&Executor> for ProbeView {
    fn from(executor: &Executor) -> Self {
        Self {
            is_healthy: executor.is_healthy,
            status: executor.status,
            failure_count: executor.failure_count,
        }
    }
}

/// State-machine outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTransition {
    /// Nothing moves beyond last_health_check
    None,
    /// Healthy again: clear failures, go online, reset the breaker
    Recover,
    /// Still online but one failure closer to the threshold
    Degrade { failures: i32 },
    /// Threshold reached: unhealthy, offline, breaker removed
    TakeOffline { failures: i32 },
}

/// Decide the transition for one probe outcome. `consecutive_successes` is
/// the in-memory counter value after this probe.
pub fn evaluate_probe(
    view: ProbeView,
    probe_ok: bool,
    consecutive_successes: i32,
    config: &HealthCheckerConfig,
) -> ProbeTransition {
    if probe_ok {
        let needs_recovery = !view.is_healthy || view.status == ExecutorStatus::Offline;
        if needs_recovery && consecutive_successes >= config.recovery_threshold.max(1) {
            ProbeTransition::Recover
        } else {
            ProbeTransition::None
        }
    } else if view.status == ExecutorStatus::Offline {
        // Failure counter is frozen while offline
        ProbeTransition::None
    } else {
        let failures = view.failure_count + 1;
        if failures >= config.failure_threshold {
            ProbeTransition::TakeOffline { failures }
        } else {
            ProbeTransition::Degrade { failures }
        }
    }
}

/// Drives the executor health state machine from periodic HTTP probes.
#[derive(Clone)]
pub struct HealthChecker {
    db: Db,
    client: ExecutorClient,
    config: HealthCheckerConfig,
    runner: Arc<TaskRunner>,
    successes: Arc<Mutex<HashMap<String, i32>>>,
    token: CancellationToken,
}

impl HealthChecker {
    pub fn new(db: Db, config: HealthCheckerConfig, runner: Arc<TaskRunner>) -> Self {
        Self {
            db,
            client: ExecutorClient::new(),
            config,
            runner,
            successes: Arc::new(Mutex::new(HashMap::new())),
            token: CancellationToken::new(),
        }
    }

    /// Spawn the probe loop; returns None when disabled by configuration.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Health checker disabled by configuration");
            return None;
        }
        let checker = self.clone();
        info!(
            interval_secs = self.config.interval.as_secs(),
            failure_threshold = self.config.failure_threshold,
            recovery_threshold = self.config.recovery_threshold,
            "Health checker started"
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = checker.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                checker.sweep().await;
            }
            debug!("Health checker loop exited");
        }))
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// One probe round over all online and offline executors. Maintenance
    /// executors are operator-parked and skipped entirely.
    pub async fn sweep(&self) {
        let executors = match ExecutorRepository::new(self.db.pool()).list_probeable().await {
            Ok(executors) => executors,
            Err(e) => {
                warn!("Health sweep could not list executors: {}", e);
                return;
            }
        };
        if executors.is_empty() {
            return;
        }

        futures_util::stream::iter(executors)
            .for_each_concurrent(self.config.max_concurrency.max(1), |executor| async move {
                self.probe_one(executor).await;
            })
            .await;
    }

    async fn probe_one(&self, executor: Executor) {
        let url = executor.probe_url();
        let probe_ok = self
            .client
            .probe(&url, probe_timeout(self.config.timeout))
            .await;

        let consecutive = {
            let mut successes = self.successes.lock().unwrap();
            if probe_ok {
                let counter = successes.entry(executor.id.clone()).or_insert(0);
                *counter += 1;
                *counter
            } else {
                successes.insert(executor.id.clone(), 0);
                0
            }
        };

        let view = ProbeView::from(&executor);
        let transition = evaluate_probe(view, probe_ok, consecutive, &self.config);

        let mut patch = ExecutorPatch {
            last_health_check: Some(utc_now()),
            ..Default::default()
        };

        match transition {
            ProbeTransition::None => {}
            ProbeTransition::Recover => {
                patch.is_healthy = Some(true);
                patch.failure_count = Some(0);
                if view.status == ExecutorStatus::Offline {
                    patch.status = Some(ExecutorStatus::Online);
                }
                self.successes.lock().unwrap().insert(executor.id.clone(), 0);
                self.runner.reset_breaker(&executor.id);
                info!(executor = %executor.instance_id, "Executor recovered");
            }
            ProbeTransition::Degrade { failures } => {
                patch.failure_count = Some(failures);
                debug!(
                    executor = %executor.instance_id,
                    failures = failures,
                    "Executor probe failed"
                );
            }
            ProbeTransition::TakeOffline { failures } => {
                patch.is_healthy = Some(false);
                patch.status = Some(ExecutorStatus::Offline);
                patch.failure_count = Some(failures);
                self.runner.remove_breaker(&executor.id);
                warn!(
                    executor = %executor.instance_id,
                    failures = failures,
                    "Executor taken offline"
                );
            }
        }

        if let Err(e) = ExecutorRepository::new(self.db.pool())
            .patch(&executor.id, patch)
            .await
        {
            warn!(executor = %executor.instance_id, "Failed to persist probe result: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthCheckerConfig {
        HealthCheckerConfig {
            failure_threshold: 3,
            recovery_threshold: 2,
            ..Default::default()
        }
    }

    fn view(is_healthy: bool, status: ExecutorStatus, failure_count: i32) -> ProbeView {
        ProbeView {
            is_healthy,
            status,
            failure_count,
        }
    }

    #[test]
    fn test_probe_timeout_clamping() {
        assert_eq!(probe_timeout(Duration::from_secs(0)), Duration::from_secs(1));
        assert_eq!(probe_timeout(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(probe_timeout(Duration::from_secs(30)), Duration::from_secs(5));
    }

    #[test]
    fn test_healthy_executor_success_is_noop() {
        let t = evaluate_probe(view(true, ExecutorStatus::Online, 0), true, 5, &config());
        assert_eq!(t, ProbeTransition::None);
    }

    #[test]
    fn test_failures_accumulate_then_go_offline() {
        let cfg = config();
        assert_eq!(
            evaluate_probe(view(true, ExecutorStatus::Online, 0), false, 0, &cfg),
            ProbeTransition::Degrade { failures: 1 }
        );
        assert_eq!(
            evaluate_probe(view(true, ExecutorStatus::Online, 1), false, 0, &cfg),
            ProbeTransition::Degrade { failures: 2 }
        );
        assert_eq!(
            evaluate_probe(view(true, ExecutorStatus::Online, 2), false, 0, &cfg),
            ProbeTransition::TakeOffline { failures: 3 }
        );
    }

    #[test]
    fn test_offline_failure_counter_is_frozen() {
        let t = evaluate_probe(view(false, ExecutorStatus::Offline, 3), false, 0, &config());
        assert_eq!(t, ProbeTransition::None);
    }

    #[test]
    fn test_recovery_requires_threshold_successes() {
        let cfg = config();
        let offline = view(false, ExecutorStatus::Offline, 3);

        assert_eq!(evaluate_probe(offline, true, 1, &cfg), ProbeTransition::None);
        assert_eq!(evaluate_probe(offline, true, 2, &cfg), ProbeTransition::Recover);
    }

    #[test]
    fn test_unhealthy_but_online_can_recover() {
        // is_healthy=false with status still online also needs recovery
        let cfg = config();
        let t = evaluate_probe(view(false, ExecutorStatus::Online, 2), true, 2, &cfg);
        assert_eq!(t, ProbeTransition::Recover);
    }

    #[test]
    fn test_recovery_threshold_floor_is_one() {
        let cfg = HealthCheckerConfig {
            recovery_threshold: 0,
            ..Default::default()
        };
        let t = evaluate_probe(view(false, ExecutorStatus::Offline, 5), true, 1, &cfg);
        assert_eq!(t, ProbeTransition::Recover);
    }
}
