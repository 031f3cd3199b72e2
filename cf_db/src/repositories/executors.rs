//! ABOUTME: Executor repository and the executor health state machine fields
//! ABOUTME: Executors sharing a name are interchangeable replicas for dispatch

use cf_core::{time::utc_now, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Operational status of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Online,
    Offline,
    /// Operator-set; the health checker never touches maintenance executors
    Maintenance,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::str::FromStr for ExecutorStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(Error::Validation(format!(
                "Unknown executor status: {}",
                other
            ))),
        }
    }
}

/// Executor entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    pub id: String,
    /// Shared by horizontal replicas; dispatch binds by name
    pub name: String,
    /// Unique per process instance
    pub instance_id: String,
    pub base_url: String,
    pub health_url: Option<String>,
    pub status: ExecutorStatus,
    pub is_healthy: bool,
    pub failure_count: i32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Executor {
    /// URL probed by the health checker
    pub fn probe_url(&self) -> String {
        match &self.health_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("{}/health", self.base_url.trim_end_matches('/')),
        }
    }
}

impl sqlx::FromRow<'_, PgRow> for Executor {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            instance_id: row.try_get("instance_id")?,
            base_url: row.try_get("base_url")?,
            health_url: row.try_get("health_url")?,
            status: status.parse().map_err(|e: Error| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
            is_healthy: row.try_get("is_healthy")?,
            failure_count: row.try_get("failure_count")?,
            last_health_check: row.try_get("last_health_check")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Registration payload for create-or-refresh by instance id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterExecutor {
    pub instance_id: String,
    pub name: String,
    pub base_url: String,
    pub health_url: Option<String>,
    pub metadata: serde_json::Value,
}

/// Minimal patch written by the health checker; None fields stay untouched
/// so concurrent registration updates are not clobbered.
#[derive(Debug, Clone, Default)]
pub struct ExecutorPatch {
    pub status: Option<ExecutorStatus>,
    pub is_healthy: Option<bool>,
    pub failure_count: Option<i32>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Executor repository
pub struct ExecutorRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> ExecutorRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create or refresh an executor keyed by instance id. Registration
    /// brings the executor online, marks it healthy, and zeroes its failure
    /// counter.
    pub async fn upsert(&self, request: RegisterExecutor) -> Result<Executor> {
        let id = Id::new().to_string();
        let now = utc_now();

        let executor = sqlx::query_as::<_, Executor>(
            r#"
            INSERT INTO executors (id, name, instance_id, base_url, health_url, status,
                                   is_healthy, failure_count, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'online', TRUE, 0, $6, $7, $7)
            ON CONFLICT (instance_id) DO UPDATE SET
                name = EXCLUDED.name,
                base_url = EXCLUDED.base_url,
                health_url = EXCLUDED.health_url,
                status = 'online',
                is_healthy = TRUE,
                failure_count = 0,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(&request.instance_id)
        .bind(&request.base_url)
        .bind(&request.health_url)
        .bind(&request.metadata)
        .bind(now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to register executor: {}", e)))?;

        Ok(executor)
    }

    /// Find executor by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Executor>> {
        let executor = sqlx::query_as::<_, Executor>("SELECT * FROM executors WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find executor: {}", e)))?;
        Ok(executor)
    }

    /// Find executor by its unique instance id
    pub async fn find_by_instance_id(&self, instance_id: &str) -> Result<Option<Executor>> {
        let executor =
            sqlx::query_as::<_, Executor>("SELECT * FROM executors WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_optional(self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to find executor: {}", e)))?;
        Ok(executor)
    }

    /// All executors
    pub async fn list(&self) -> Result<Vec<Executor>> {
        let executors =
            sqlx::query_as::<_, Executor>("SELECT * FROM executors ORDER BY name, instance_id")
                .fetch_all(self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to list executors: {}", e)))?;
        Ok(executors)
    }

    /// Executors the health checker probes: online or offline, never
    /// maintenance.
    pub async fn list_probeable(&self) -> Result<Vec<Executor>> {
        let executors = sqlx::query_as::<_, Executor>(
            "SELECT * FROM executors WHERE status IN ('online', 'offline') ORDER BY name",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list probeable executors: {}", e)))?;
        Ok(executors)
    }

    /// Dispatch candidates for a task: executors whose name is assigned to
    /// the task, online and healthy, ordered by assignment priority.
    pub async fn find_candidates(&self, task_id: &str) -> Result<Vec<Executor>> {
        let executors = sqlx::query_as::<_, Executor>(
            r#"
            SELECT e.* FROM executors e
            JOIN task_assignments a ON a.executor_name = e.name
            WHERE a.task_id = $1
              AND e.status = 'online'
              AND e.is_healthy = TRUE
            ORDER BY a.priority DESC, e.instance_id
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to query candidates: {}", e)))?;
        Ok(executors)
    }

    /// Apply a minimal patch; only provided fields move
    pub async fn patch(&self, id: &str, patch: ExecutorPatch) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executors SET
                status = COALESCE($2, status),
                is_healthy = COALESCE($3, is_healthy),
                failure_count = COALESCE($4, failure_count),
                last_health_check = COALESCE($5, last_health_check),
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str().to_string()))
        .bind(patch.is_healthy)
        .bind(patch.failure_count)
        .bind(patch.last_health_check)
        .bind(utc_now())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to patch executor: {}", e)))?;
        Ok(())
    }

    /// Operator status control (maintenance / activate)
    pub async fn set_status(&self, id: &str, status: ExecutorStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE executors SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(utc_now())
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to set executor status: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove an executor row
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM executors WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete executor: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(base_url: &str, health_url: Option<&str>) -> Executor {
        Executor {
            id: "ex-1".to_string(),
            name: "worker".to_string(),
            instance_id: "worker-1".to_string(),
            base_url: base_url.to_string(),
            health_url: health_url.map(|s| s.to_string()),
            status: ExecutorStatus::Online,
            is_healthy: true,
            failure_count: 0,
            last_health_check: None,
            metadata: serde_json::json!({}),
            created_at: utc_now(),
            updated_at: utc_now(),
        }
    }

    #[test]
    fn test_probe_url_defaults_to_base_url_health() {
        let e = executor("http://10.0.0.1:9000", None);
        assert_eq!(e.probe_url(), "http://10.0.0.1:9000/health");

        let trailing = executor("http://10.0.0.1:9000/", None);
        assert_eq!(trailing.probe_url(), "http://10.0.0.1:9000/health");
    }

    #[test]
    fn test_probe_url_prefers_explicit_health_url() {
        let e = executor("http://10.0.0.1:9000", Some("http://10.0.0.1:9000/livez"));
        assert_eq!(e.probe_url(), "http://10.0.0.1:9000/livez");

        // Empty string behaves like absent
        let empty = executor("http://10.0.0.1:9000", Some(""));
        assert_eq!(empty.probe_url(), "http://10.0.0.1:9000/health");
    }

    #[test]
    fn test_executor_status_round_trip() {
        for status in [
            ExecutorStatus::Online,
            ExecutorStatus::Offline,
            ExecutorStatus::Maintenance,
        ] {
            assert_eq!(status.as_str().parse::<ExecutorStatus>().unwrap(), status);
        }
        assert!("draining".parse::<ExecutorStatus>().is_err());
    }
}
