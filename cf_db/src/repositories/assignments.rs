//! ABOUTME: Task-to-executor assignment repository
//! ABOUTME: Assignments bind by executor name, not id

use cf_core::{Error, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// A (task, executor-name) pairing with dispatch priority and weight.
/// Any executor carrying the name is a candidate.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskAssignment {
    pub id: String,
    pub task_id: String,
    pub executor_name: String,
    pub priority: i32,
    pub weight: i32,
}

/// Assignment repository
pub struct AssignmentRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> AssignmentRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create the assignment if it does not exist; existing rows keep their
    /// priority and weight.
    pub async fn ensure(
        &self,
        task_id: &str,
        executor_name: &str,
        priority: i32,
        weight: i32,
    ) -> Result<TaskAssignment> {
        let id = Id::new().to_string();

        let assignment = sqlx::query_as::<_, TaskAssignment>(
            r#"
            INSERT INTO task_assignments (id, task_id, executor_name, priority, weight)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id, executor_name) DO UPDATE SET
                task_id = EXCLUDED.task_id
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(task_id)
        .bind(executor_name)
        .bind(priority)
        .bind(weight)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to ensure assignment: {}", e)))?;

        Ok(assignment)
    }

    /// All assignments for a task
    pub async fn list_for_task(&self, task_id: &str) -> Result<Vec<TaskAssignment>> {
        let assignments = sqlx::query_as::<_, TaskAssignment>(
            "SELECT * FROM task_assignments WHERE task_id = $1 ORDER BY priority DESC",
        )
        .bind(task_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list assignments: {}", e)))?;
        Ok(assignments)
    }

    /// Update priority and weight of one assignment
    pub async fn update(&self, id: &str, priority: i32, weight: i32) -> Result<bool> {
        let result =
            sqlx::query("UPDATE task_assignments SET priority = $2, weight = $3 WHERE id = $1")
                .bind(id)
                .bind(priority)
                .bind(weight)
                .execute(self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to update assignment: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove one assignment
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM task_assignments WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete assignment: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }
}
