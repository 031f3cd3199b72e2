//! ABOUTME: Task repository for recurring job definitions
//! ABOUTME: Owns the task status, execution mode, and balance strategy enums

use cf_core::{time::utc_now, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::Validation(format!("Unknown task status: {}", other))),
        }
    }
}

/// How concurrent firings of one task are arbitrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every firing creates an execution
    Parallel,
    /// A firing is silently dropped while one execution is pending/running
    Sequential,
    /// A firing is recorded as a skipped execution while one is in flight
    Skip,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Skip => "skip",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "skip" => Ok(Self::Skip),
            other => Err(Error::Validation(format!(
                "Unknown execution mode: {}",
                other
            ))),
        }
    }
}

/// Executor selection strategy for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    Sticky,
    LeastLoaded,
}

impl LbStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::Random => "random",
            Self::Sticky => "sticky",
            Self::LeastLoaded => "least_loaded",
        }
    }
}

impl std::str::FromStr for LbStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "random" => Ok(Self::Random),
            "sticky" => Ok(Self::Sticky),
            "least_loaded" => Ok(Self::LeastLoaded),
            other => Err(Error::Validation(format!(
                "Unknown balance strategy: {}",
                other
            ))),
        }
    }
}

/// Task entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    pub parameters: serde_json::Value,
    pub execution_mode: ExecutionMode,
    pub lb_strategy: LbStrategy,
    pub max_retry: i32,
    pub timeout_seconds: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn decode_err(column: &str, err: Error) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    }
}

impl sqlx::FromRow<'_, PgRow> for Task {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let mode: String = row.try_get("execution_mode")?;
        let strategy: String = row.try_get("lb_strategy")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cron_expr: row.try_get("cron_expr")?,
            parameters: row.try_get("parameters")?,
            execution_mode: mode.parse().map_err(|e| decode_err("execution_mode", e))?,
            lb_strategy: strategy.parse().map_err(|e| decode_err("lb_strategy", e))?,
            max_retry: row.try_get("max_retry")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            status: status.parse().map_err(|e| decode_err("status", e))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Request to create a new task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub cron_expr: String,
    pub parameters: serde_json::Value,
    pub execution_mode: ExecutionMode,
    pub lb_strategy: LbStrategy,
    pub max_retry: i32,
    pub timeout_seconds: i32,
    pub status: TaskStatus,
}

/// Partial update of a task; None fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub cron_expr: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub execution_mode: Option<ExecutionMode>,
    pub lb_strategy: Option<LbStrategy>,
    pub max_retry: Option<i32>,
    pub timeout_seconds: Option<i32>,
}

/// Task repository
pub struct TaskRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> TaskRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create a new task
    pub async fn create(&self, request: CreateTaskRequest) -> Result<Task> {
        let id = Id::new().to_string();
        let now = utc_now();

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (id, name, cron_expr, parameters, execution_mode, lb_strategy,
                               max_retry, timeout_seconds, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(&request.cron_expr)
        .bind(&request.parameters)
        .bind(request.execution_mode.as_str())
        .bind(request.lb_strategy.as_str())
        .bind(request.max_retry)
        .bind(request.timeout_seconds)
        .bind(request.status.as_str())
        .bind(now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create task: {}", e)))?;

        Ok(task)
    }

    /// Find task by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find task: {}", e)))?;
        Ok(task)
    }

    /// Find task by its unique name
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find task by name: {}", e)))?;
        Ok(task)
    }

    /// All tasks that are not soft-deleted
    pub async fn list(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status <> 'deleted' ORDER BY name",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list tasks: {}", e)))?;
        Ok(tasks)
    }

    /// Tasks visible to the cron engine
    pub async fn list_active(&self) -> Result<Vec<Task>> {
        let tasks =
            sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = 'active' ORDER BY name")
                .fetch_all(self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to list active tasks: {}", e)))?;
        Ok(tasks)
    }

    /// Apply a partial update; only provided fields change
    pub async fn update(&self, id: &str, request: UpdateTaskRequest) -> Result<Option<Task>> {
        let now = utc_now();
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks SET
                cron_expr = COALESCE($2, cron_expr),
                parameters = COALESCE($3, parameters),
                execution_mode = COALESCE($4, execution_mode),
                lb_strategy = COALESCE($5, lb_strategy),
                max_retry = COALESCE($6, max_retry),
                timeout_seconds = COALESCE($7, timeout_seconds),
                updated_at = $8
            WHERE id = $1 AND status <> 'deleted'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(request.cron_expr)
        .bind(request.parameters)
        .bind(request.execution_mode.map(|m| m.as_str().to_string()))
        .bind(request.lb_strategy.map(|s| s.as_str().to_string()))
        .bind(request.max_retry)
        .bind(request.timeout_seconds)
        .bind(now)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update task: {}", e)))?;

        Ok(task)
    }

    /// Change only the status; all other fields are untouched
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $2, updated_at = $3 WHERE id = $1 AND status <> 'deleted'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(utc_now())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to set task status: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete a task
    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        self.set_status(id, TaskStatus::Deleted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for status in [TaskStatus::Active, TaskStatus::Paused, TaskStatus::Deleted] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        for mode in [
            ExecutionMode::Parallel,
            ExecutionMode::Sequential,
            ExecutionMode::Skip,
        ] {
            assert_eq!(mode.as_str().parse::<ExecutionMode>().unwrap(), mode);
        }
        for strategy in [
            LbStrategy::RoundRobin,
            LbStrategy::WeightedRoundRobin,
            LbStrategy::Random,
            LbStrategy::Sticky,
            LbStrategy::LeastLoaded,
        ] {
            assert_eq!(strategy.as_str().parse::<LbStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_unknown_enum_values_are_rejected() {
        assert!("archived".parse::<TaskStatus>().is_err());
        assert!("serial".parse::<ExecutionMode>().is_err());
        assert!("rr".parse::<LbStrategy>().is_err());
    }
}
