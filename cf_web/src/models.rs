//! ABOUTME: Request and response models for the management API
//! ABOUTME: Includes the RFC 7807 problem body and all endpoint DTOs

use cf_db::{ExecutionMode, LbStrategy, TaskStatus};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// RFC 7807 Problem Details body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProblemDetails {
    fn new(title: &str, status: u16, detail: String) -> Self {
        Self {
            type_uri: "about:blank".to_string(),
            title: title.to_string(),
            status: Some(status),
            detail: Some(detail),
        }
    }

    pub fn bad_request(detail: String) -> Self {
        Self::new("Bad Request", 400, detail)
    }

    pub fn not_found(detail: String) -> Self {
        Self::new("Not Found", 404, detail)
    }

    pub fn conflict(detail: String) -> Self {
        Self::new("Conflict", 409, detail)
    }

    pub fn internal(detail: String) -> Self {
        Self::new("Internal Server Error", 500, detail)
    }
}

/// Simple message body for accepted/acknowledged responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub message: String,
}

impl Note {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({})
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Parallel
}

fn default_lb_strategy() -> LbStrategy {
    LbStrategy::RoundRobin
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Active
}

fn default_weight() -> i32 {
    1
}

/// Assignment spec embedded in task creation
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AssignmentBody {
    #[validate(length(min = 1))]
    pub executor_name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

/// Request payload for task creation
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateTaskBody {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1))]
    pub cron_expr: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_lb_strategy")]
    pub lb_strategy: LbStrategy,
    #[serde(default)]
    pub max_retry: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub assignments: Vec<AssignmentBody>,
}

/// Request payload for task update; absent fields stay unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskBody {
    pub cron_expr: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub execution_mode: Option<ExecutionMode>,
    pub lb_strategy: Option<LbStrategy>,
    pub max_retry: Option<i32>,
    pub timeout_seconds: Option<i32>,
}

/// Request payload for a manual trigger
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerBody {
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Task spec inside an executor registration. Unknown tasks are created
/// paused unless `active` is set; a cron expression is required for
/// auto-creation.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterTaskSpec {
    pub name: String,
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

/// Request payload for executor registration
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterBody {
    #[validate(length(min = 1, max = 255))]
    pub instance_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(url)]
    pub base_url: String,
    pub health_url: Option<String>,
    #[serde(default)]
    pub tasks: Vec<RegisterTaskSpec>,
    #[serde(default = "default_parameters")]
    pub metadata: serde_json::Value,
}

/// Terminal callback from a worker
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackBody {
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub logs: Option<String>,
}

/// Executions listing query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionsQuery {
    pub task_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_task_body_defaults() {
        let body: CreateTaskBody = serde_json::from_value(serde_json::json!({
            "name": "nightly-report",
            "cron_expr": "0 0 2 * * *"
        }))
        .unwrap();

        assert_eq!(body.execution_mode, ExecutionMode::Parallel);
        assert_eq!(body.lb_strategy, LbStrategy::RoundRobin);
        assert_eq!(body.max_retry, 0);
        assert_eq!(body.timeout_seconds, 0);
        assert_eq!(body.status, TaskStatus::Active);
        assert!(body.assignments.is_empty());
        assert_eq!(body.parameters, serde_json::json!({}));
    }

    #[test]
    fn test_register_body_minimal() {
        let body: RegisterBody = serde_json::from_value(serde_json::json!({
            "instance_id": "worker-1",
            "name": "worker",
            "base_url": "http://10.0.0.1:9000"
        }))
        .unwrap();

        assert!(body.tasks.is_empty());
        assert!(body.health_url.is_none());
        assert!(body.validate().is_ok());
    }

    #[test]
    fn test_problem_details_serializes_type_field() {
        let problem = ProblemDetails::not_found("task t-1".to_string());
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "about:blank");
        assert_eq!(json["status"], 404);
    }
}
