//! ABOUTME: HTTP client for dispatching work to executors
//! ABOUTME: Owns the wire format of the execute and stop calls

use cf_core::{Error, Result};
use cf_db::Executor;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Body of `POST {base_url}/execute`. Field names are part of the worker
/// protocol; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    pub parameters: serde_json::Value,
    pub callback_url: String,
}

/// Body of `POST {base_url}/stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPayload {
    pub execution_id: String,
}

/// Clamp a task-configured dispatch timeout into the allowed window.
/// Zero or negative means unset and yields the default of 10 seconds.
pub fn dispatch_timeout(timeout_seconds: i32) -> Duration {
    if timeout_seconds <= 0 {
        return Duration::from_secs(10);
    }
    Duration::from_secs((timeout_seconds as u64).clamp(1, 30))
}

/// HTTP client shared by all dispatch workers
#[derive(Debug, Clone)]
pub struct ExecutorClient {
    http: Client,
}

impl ExecutorClient {
    pub fn new() -> Self {
        // Per-request timeouts only; the shared client carries none.
        Self {
            http: Client::new(),
        }
    }

    /// Dispatch an execution to an executor. 200 and 202 are both accepted:
    /// workers run asynchronously and report through the callback.
    pub async fn execute(
        &self,
        executor: &Executor,
        payload: &ExecutePayload,
        timeout: Duration,
    ) -> Result<()> {
        let url = format!("{}/execute", executor.base_url.trim_end_matches('/'));
        debug!(url = %url, execution_id = %payload.execution_id, "Dispatching execution");

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("Dispatch to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.as_u16() == 200 || status.as_u16() == 202 {
            Ok(())
        } else {
            Err(Error::Dispatch(format!(
                "Executor {} rejected dispatch with status {}",
                executor.instance_id, status
            )))
        }
    }

    /// Ask an executor to stop a running execution (operator-initiated)
    pub async fn stop(&self, executor: &Executor, execution_id: &str) -> Result<()> {
        let url = format!("{}/stop", executor.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .json(&StopPayload {
                execution_id: execution_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("Stop call to {} failed: {}", url, e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Dispatch(format!(
                "Executor {} rejected stop with status {}",
                executor.instance_id,
                response.status()
            )))
        }
    }

    /// Probe a health URL; any 2xx is healthy
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

impl Default for ExecutorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::online_executor;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor(base_url: &str) -> Executor {
        online_executor("ex-1", "worker", base_url)
    }

    fn payload() -> ExecutePayload {
        ExecutePayload {
            execution_id: "x-1".to_string(),
            task_id: "t-1".to_string(),
            task_name: "nightly-report".to_string(),
            parameters: serde_json::json!({"day": "2024-01-01"}),
            callback_url: "http://scheduler:8080/api/executions/x-1/callback".to_string(),
        }
    }

    #[test]
    fn test_execute_payload_field_names() {
        let json = serde_json::to_value(payload()).unwrap();
        let obj = json.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "callback_url",
                "execution_id",
                "parameters",
                "task_id",
                "task_name"
            ]
        );
    }

    #[test]
    fn test_dispatch_timeout_clamping() {
        assert_eq!(dispatch_timeout(0), Duration::from_secs(10));
        assert_eq!(dispatch_timeout(-5), Duration::from_secs(10));
        assert_eq!(dispatch_timeout(1), Duration::from_secs(1));
        assert_eq!(dispatch_timeout(15), Duration::from_secs(15));
        assert_eq!(dispatch_timeout(300), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_execute_accepts_200_and_202() {
        for status in [200u16, 202] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/execute"))
                .and(body_json(payload()))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let client = ExecutorClient::new();
            let result = client
                .execute(&executor(&server.uri()), &payload(), Duration::from_secs(5))
                .await;
            assert!(result.is_ok(), "status {} should be accepted", status);
        }
    }

    #[tokio::test]
    async fn test_execute_rejects_other_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ExecutorClient::new();
        let result = client
            .execute(&executor(&server.uri()), &payload(), Duration::from_secs(5))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_stop_posts_execution_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stop"))
            .and(body_json(serde_json::json!({"execution_id": "x-1"})))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = ExecutorClient::new();
        let result = client.stop(&executor(&server.uri()), "x-1").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_probe_treats_2xx_as_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ExecutorClient::new();
        assert!(
            client
                .probe(&format!("{}/health", server.uri()), Duration::from_secs(2))
                .await
        );
        assert!(
            !client
                .probe("http://127.0.0.1:1/health", Duration::from_secs(1))
                .await
        );
    }
}
