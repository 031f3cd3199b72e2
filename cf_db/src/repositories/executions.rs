//! ABOUTME: Execution repository for single runs of a task
//! ABOUTME: Terminal statuses are write-once; guards enforce monotonicity

use cf_core::{time::utc_now, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Lifecycle status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!(
                "Unknown execution status: {}",
                other
            ))),
        }
    }
}

/// Execution entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub executor_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub log: String,
    pub retry_count: i32,
}

impl sqlx::FromRow<'_, PgRow> for Execution {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            executor_id: row.try_get("executor_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            status: status.parse().map_err(|e: Error| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
            result: row.try_get("result")?,
            log: row.try_get("log")?,
            retry_count: row.try_get("retry_count")?,
        })
    }
}

/// Listing filter for the API layer
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub task_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: i64,
}

/// Execution counts by status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub timeout: i64,
    pub skipped: i64,
    pub cancelled: i64,
}

/// Execution repository
pub struct ExecutionRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> ExecutionRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create a fresh pending execution for a task
    pub async fn create_pending(&self, task_id: &str) -> Result<Execution> {
        let id = Id::new().to_string();
        let now = utc_now();

        let execution = sqlx::query_as::<_, Execution>(
            r#"
            INSERT INTO executions (id, task_id, scheduled_at, status, log, retry_count)
            VALUES ($1, $2, $3, 'pending', '', 0)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(task_id)
        .bind(now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create execution: {}", e)))?;

        Ok(execution)
    }

    /// Create a terminal skipped record (skip execution mode)
    pub async fn create_skipped(&self, task_id: &str, log: &str) -> Result<Execution> {
        let id = Id::new().to_string();
        let now = utc_now();

        let execution = sqlx::query_as::<_, Execution>(
            r#"
            INSERT INTO executions (id, task_id, scheduled_at, ended_at, status, log, retry_count)
            VALUES ($1, $2, $3, $3, 'skipped', $4, 0)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(task_id)
        .bind(now)
        .bind(log)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create skipped execution: {}", e)))?;

        Ok(execution)
    }

    /// Find execution by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find execution: {}", e)))?;
        Ok(execution)
    }

    /// Transition pending -> running with a start timestamp
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(utc_now())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to mark execution running: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the executor chosen for an attempt
    pub async fn assign_executor(&self, id: &str, executor_id: &str, retry_count: i32) -> Result<()> {
        sqlx::query("UPDATE executions SET executor_id = $2, retry_count = $3 WHERE id = $1")
            .bind(id)
            .bind(executor_id)
            .bind(retry_count)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to assign executor: {}", e)))?;
        Ok(())
    }

    /// Move an execution to a terminal status. The guard makes terminal
    /// states write-once: a late timeout or duplicate callback sees zero
    /// rows affected and becomes a no-op.
    pub async fn finalize(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        log: &str,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, result = $3, log = $4, ended_at = $5
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(result)
        .bind(log)
        .bind(utc_now())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to finalize execution: {}", e)))?;

        Ok(updated.rows_affected() > 0)
    }

    /// Number of in-flight executions for a task (execution-mode policy)
    pub async fn count_active(&self, task_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM executions WHERE task_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(task_id)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to count active executions: {}", e)))?;
        Ok(count)
    }

    /// Running executions across all executors sharing a name (least-loaded
    /// strategy groups horizontal replicas by name).
    pub async fn count_running_for_executor_name(&self, executor_name: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM executions x
            JOIN executors e ON x.executor_id = e.id
            WHERE e.name = $1 AND x.status = 'running'
            "#,
        )
        .bind(executor_name)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to count running executions: {}", e)))?;
        Ok(count)
    }

    /// Filtered listing, newest first
    pub async fn list(&self, filter: ExecutionFilter) -> Result<Vec<Execution>> {
        let limit = if filter.limit <= 0 { 100 } else { filter.limit.min(1000) };
        let executions = sqlx::query_as::<_, Execution>(
            r#"
            SELECT * FROM executions
            WHERE ($1::text IS NULL OR task_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY scheduled_at DESC
            LIMIT $3
            "#,
        )
        .bind(filter.task_id)
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list executions: {}", e)))?;
        Ok(executions)
    }

    /// Counts by status for the stats endpoint
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM executions GROUP BY status")
            .fetch_all(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count executions: {}", e)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| Error::Database(format!("Failed to read status counts: {}", e)))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| Error::Database(format!("Failed to read status counts: {}", e)))?;
            match status.as_str() {
                "pending" => counts.pending = count,
                "running" => counts.running = count,
                "success" => counts.success = count,
                "failed" => counts.failed = count,
                "timeout" => counts.timeout = count,
                "skipped" => counts.skipped = count,
                "cancelled" => counts.cancelled = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Skipped,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("done".parse::<ExecutionStatus>().is_err());
    }
}
