//! ABOUTME: Shared test fixtures for cronfleet crates
//! ABOUTME: Entity builders used by the dispatch engine tests

use cf_core::time::utc_now;
use cf_db::{Executor, ExecutorStatus};

/// An online, healthy executor at the given base URL, as it would look
/// right after registration.
pub fn online_executor(id: &str, name: &str, base_url: &str) -> Executor {
    Executor {
        id: id.to_string(),
        name: name.to_string(),
        instance_id: format!("{}-1", id),
        base_url: base_url.to_string(),
        health_url: None,
        status: ExecutorStatus::Online,
        is_healthy: true,
        failure_count: 0,
        last_health_check: None,
        metadata: serde_json::json!({}),
        created_at: utc_now(),
        updated_at: utc_now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_executor_is_dispatchable() {
        let executor = online_executor("ex-1", "worker", "http://10.0.0.1:9000");
        assert_eq!(executor.status, ExecutorStatus::Online);
        assert!(executor.is_healthy);
        assert_eq!(executor.failure_count, 0);
        assert_eq!(executor.probe_url(), "http://10.0.0.1:9000/health");
    }
}
