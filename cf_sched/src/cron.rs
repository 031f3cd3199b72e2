//! ABOUTME: Cron engine firing callbacks at seconds-precision instants
//! ABOUTME: One loop task per entry; firings are serialized per entry

use cf_core::{Error, Result};
use chrono::Utc;
use cron::Schedule;
use futures_util::future::BoxFuture;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Callback fired at each matching instant
pub type CronCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Validate a six-field (seconds-precision) cron expression
pub fn validate_cron_expr(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 6 {
        return Err(Error::Validation(format!(
            "Cron expression '{}' must have 6 fields (seconds precision), got {}",
            expr, fields
        )));
    }
    Schedule::from_str(expr)
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}

struct Entry {
    schedule: Schedule,
    callback: CronCallback,
}

struct EngineInner {
    running: bool,
    token: CancellationToken,
    entries: Vec<Arc<Entry>>,
    loops: Vec<JoinHandle<()>>,
}

/// Fires registered callbacks at their cron instants while started.
///
/// Each entry runs its own loop: sleep to the next instant, await the
/// callback, compute the next instant. Awaiting the callback before the
/// next sleep means a long callback never overlaps its own next tick.
pub struct CronEngine {
    inner: tokio::sync::Mutex<EngineInner>,
}

impl CronEngine {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(EngineInner {
                running: false,
                token: CancellationToken::new(),
                entries: Vec::new(),
                loops: Vec::new(),
            }),
        }
    }

    /// Register an entry. If the engine is started the entry begins firing
    /// immediately.
    pub async fn add(&self, expr: &str, callback: CronCallback) -> Result<()> {
        let schedule = validate_cron_expr(expr)?;
        let entry = Arc::new(Entry { schedule, callback });

        let mut inner = self.inner.lock().await;
        if inner.running {
            let handle = spawn_entry_loop(entry.clone(), inner.token.clone());
            inner.loops.push(handle);
        }
        inner.entries.push(entry);
        Ok(())
    }

    /// Cancel and drain all entry loops, then clear the entry table. The
    /// engine keeps its started/stopped state.
    pub async fn remove_all(&self) {
        let mut inner = self.inner.lock().await;
        drain(&mut inner).await;
        inner.entries.clear();
        if inner.running {
            // Later adds must spawn against a live token
            inner.token = CancellationToken::new();
        }
        debug!("Cron engine entries cleared");
    }

    /// Start firing all registered entries
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return;
        }
        inner.running = true;
        inner.token = CancellationToken::new();
        let token = inner.token.clone();
        let handles: Vec<_> = inner
            .entries
            .iter()
            .map(|entry| spawn_entry_loop(entry.clone(), token.clone()))
            .collect();
        inner.loops = handles;
        info!(entries = inner.entries.len(), "Cron engine started");
    }

    /// Stop firing. In-flight callbacks are awaited, not aborted.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return;
        }
        drain(&mut inner).await;
        inner.running = false;
        info!("Cron engine stopped");
    }

    /// Number of registered entries
    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(inner: &mut EngineInner) {
    inner.token.cancel();
    for handle in inner.loops.drain(..) {
        let _ = handle.await;
    }
}

fn spawn_entry_loop(entry: Arc<Entry>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = entry.schedule.after(&now).next() else {
                // Expression has no future instants
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            // Fire; the await serializes firings of this entry
            (entry.callback)().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_validate_cron_expr() {
        assert!(validate_cron_expr("* * * * * *").is_ok());
        assert!(validate_cron_expr("0 */5 * * * *").is_ok());
        assert!(validate_cron_expr("30 0 12 * * Mon").is_ok());

        // Five-field expressions are rejected: seconds are required
        assert!(validate_cron_expr("*/5 * * * *").is_err());
        assert!(validate_cron_expr("").is_err());
        assert!(validate_cron_expr("61 * * * * *").is_err());
        assert!(validate_cron_expr("not a cron").is_err());
    }

    #[test]
    fn test_next_instants_every_second() {
        let schedule = validate_cron_expr("* * * * * *").unwrap();
        let now = Utc::now();
        let runs: Vec<_> = schedule.after(&now).take(3).collect();
        assert_eq!(runs.len(), 3);
        assert_eq!((runs[1] - runs[0]).num_seconds(), 1);
        assert_eq!((runs[2] - runs[1]).num_seconds(), 1);
    }

    #[tokio::test]
    async fn test_engine_fires_and_stops() {
        let engine = CronEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        engine
            .add(
                "* * * * * *",
                Arc::new(move || {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await
            .unwrap();

        engine.start().await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        engine.stop().await;

        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 1, "expected at least one firing, got {}", count);

        // No further firings after stop
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }

    #[tokio::test]
    async fn test_remove_all_clears_entries() {
        let engine = CronEngine::new();
        engine
            .add("* * * * * *", Arc::new(|| Box::pin(async {})))
            .await
            .unwrap();
        assert_eq!(engine.entry_count().await, 1);

        engine.remove_all().await;
        assert_eq!(engine.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_expression() {
        let engine = CronEngine::new();
        let result = engine
            .add("*/5 * * * *", Arc::new(|| Box::pin(async {})))
            .await;
        assert!(result.is_err());
    }
}
