//! ABOUTME: Executor selection strategies with a persisted per-task cursor
//! ABOUTME: Selection math is pure; persistence and locking wrap it

use cf_core::{Error, Result};
use cf_db::{AssignmentRepository, CursorRepository, Db, ExecutionRepository, Executor, LbStrategy, Task};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Pick the round-robin candidate. Returns the chosen index and the next
/// cursor index.
fn pick_round_robin(len: usize, rr_index: i64) -> (usize, i64) {
    let index = rr_index.rem_euclid(len as i64) as usize;
    (index, (rr_index + 1).rem_euclid(len as i64))
}

/// Walk candidates accumulating weights until the running sum exceeds the
/// target. Weights are already coerced to at least 1. Returns None when the
/// total weight is zero (caller falls back to round-robin).
fn pick_weighted(weights: &[i64], rr_index: i64) -> Option<(usize, i64)> {
    let total: i64 = weights.iter().sum();
    if total <= 0 {
        return None;
    }
    let target = rr_index.rem_euclid(total);
    let mut sum = 0i64;
    for (i, w) in weights.iter().enumerate() {
        sum += w;
        if sum > target {
            return Some((i, (rr_index + 1).rem_euclid(total)));
        }
    }
    Some((weights.len() - 1, (rr_index + 1).rem_euclid(total)))
}

/// Prefer the remembered executor while it is still a candidate; otherwise
/// stick to the first candidate.
fn pick_sticky(candidates: &[Executor], sticky_id: Option<&str>) -> (usize, bool) {
    if let Some(id) = sticky_id {
        if let Some(index) = candidates.iter().position(|c| c.id == id) {
            return (index, false);
        }
    }
    (0, true)
}

/// First index with the minimum load
fn pick_least_loaded(loads: &[i64]) -> usize {
    let mut best = 0;
    for (i, load) in loads.iter().enumerate() {
        if *load < loads[best] {
            best = i;
        }
    }
    best
}

/// Coerce an assignment weight: default 1, anything below 1 becomes 1
fn coerce_weight(weight: Option<i32>) -> i64 {
    match weight {
        Some(w) if w > 0 => w as i64,
        _ => 1,
    }
}

/// Load balancer with one persisted cursor per task.
///
/// Cursor mutation is read-modify-write; a per-task async mutex serializes
/// concurrent firings of the same task on this replica.
pub struct LoadBalancer {
    db: Db,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LoadBalancer {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Select one executor from a non-empty candidate list using the task's
    /// strategy.
    pub async fn select(&self, task: &Task, candidates: &[Executor]) -> Result<Executor> {
        if candidates.is_empty() {
            return Err(Error::Dispatch(format!(
                "No candidates to select from for task {}",
                task.name
            )));
        }

        // Random needs no cursor and no serialization
        if task.lb_strategy == LbStrategy::Random {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            return Ok(candidates[index].clone());
        }

        let lock = self.task_lock(&task.id).await;
        let _guard = lock.lock().await;

        let cursors = CursorRepository::new(self.db.pool());
        let mut cursor = cursors.get_or_create(&task.id).await?;

        let chosen = match task.lb_strategy {
            LbStrategy::RoundRobin => {
                let (index, next) = pick_round_robin(candidates.len(), cursor.rr_index);
                cursor.rr_index = next;
                candidates[index].clone()
            }
            LbStrategy::WeightedRoundRobin => {
                let weights = self.candidate_weights(task, candidates).await?;
                match pick_weighted(&weights, cursor.rr_index) {
                    Some((index, next)) => {
                        cursor.rr_index = next;
                        candidates[index].clone()
                    }
                    None => {
                        let (index, next) = pick_round_robin(candidates.len(), cursor.rr_index);
                        cursor.rr_index = next;
                        candidates[index].clone()
                    }
                }
            }
            LbStrategy::Sticky => {
                let (index, moved) = pick_sticky(candidates, cursor.sticky_executor_id.as_deref());
                if moved {
                    cursor.sticky_executor_id = Some(candidates[index].id.clone());
                }
                candidates[index].clone()
            }
            LbStrategy::LeastLoaded => {
                let loads = self.candidate_loads(candidates).await?;
                let index = pick_least_loaded(&loads);
                candidates[index].clone()
            }
            LbStrategy::Random => unreachable!("handled above"),
        };

        cursor.last_executor_id = Some(chosen.id.clone());
        cursors.save(&cursor).await?;

        debug!(
            task = %task.name,
            strategy = task.lb_strategy.as_str(),
            executor = %chosen.instance_id,
            "Selected executor"
        );
        Ok(chosen)
    }

    /// Assignment weights restricted to the current candidates, aligned by
    /// candidate index.
    async fn candidate_weights(&self, task: &Task, candidates: &[Executor]) -> Result<Vec<i64>> {
        let assignments = AssignmentRepository::new(self.db.pool())
            .list_for_task(&task.id)
            .await?;
        let by_name: HashMap<&str, i32> = assignments
            .iter()
            .map(|a| (a.executor_name.as_str(), a.weight))
            .collect();

        Ok(candidates
            .iter()
            .map(|c| coerce_weight(by_name.get(c.name.as_str()).copied()))
            .collect())
    }

    /// Running-execution counts grouped by executor name, aligned by
    /// candidate index. Executors sharing a name are replicas of one
    /// logical worker.
    async fn candidate_loads(&self, candidates: &[Executor]) -> Result<Vec<i64>> {
        let executions = ExecutionRepository::new(self.db.pool());
        let mut by_name: HashMap<String, i64> = HashMap::new();
        let mut loads = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let load = match by_name.get(&candidate.name) {
                Some(load) => *load,
                None => {
                    let load = executions
                        .count_running_for_executor_name(&candidate.name)
                        .await?;
                    by_name.insert(candidate.name.clone(), load);
                    load
                }
            };
            loads.push(load);
        }
        Ok(loads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::online_executor;

    fn executor(id: &str, name: &str) -> Executor {
        online_executor(id, name, &format!("http://{}", id))
    }

    #[test]
    fn test_round_robin_walks_and_wraps() {
        let mut index = 0i64;
        let mut seen = Vec::new();
        for _ in 0..5 {
            let (chosen, next) = pick_round_robin(3, index);
            seen.push(chosen);
            index = next;
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_round_robin_tolerates_stale_index() {
        // Cursor index beyond the current candidate count still lands in range
        let (chosen, next) = pick_round_robin(2, 7);
        assert_eq!(chosen, 1);
        assert_eq!(next, 0);
    }

    #[test]
    fn test_weighted_walk_respects_weights() {
        // Weights 2,1: pattern over one period of 3 is [0, 0, 1]
        let weights = vec![2, 1];
        let mut index = 0i64;
        let mut seen = Vec::new();
        for _ in 0..6 {
            let (chosen, next) = pick_weighted(&weights, index).unwrap();
            seen.push(chosen);
            index = next;
        }
        assert_eq!(seen, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_weighted_zero_total_falls_back() {
        assert!(pick_weighted(&[], 0).is_none());
    }

    #[test]
    fn test_weight_coercion() {
        assert_eq!(coerce_weight(None), 1);
        assert_eq!(coerce_weight(Some(0)), 1);
        assert_eq!(coerce_weight(Some(-3)), 1);
        assert_eq!(coerce_weight(Some(5)), 5);
    }

    #[test]
    fn test_sticky_prefers_remembered_candidate() {
        let candidates = vec![executor("a", "w"), executor("b", "w")];

        let (index, moved) = pick_sticky(&candidates, Some("b"));
        assert_eq!(index, 1);
        assert!(!moved);

        // Remembered executor gone: stick to the first and remember it
        let (index, moved) = pick_sticky(&candidates, Some("gone"));
        assert_eq!(index, 0);
        assert!(moved);

        let (index, moved) = pick_sticky(&candidates, None);
        assert_eq!(index, 0);
        assert!(moved);
    }

    #[test]
    fn test_least_loaded_first_minimum_wins() {
        assert_eq!(pick_least_loaded(&[3, 1, 1, 2]), 1);
        assert_eq!(pick_least_loaded(&[0]), 0);
        assert_eq!(pick_least_loaded(&[2, 2, 2]), 0);
    }
}
