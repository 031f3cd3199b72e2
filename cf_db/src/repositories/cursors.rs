//! ABOUTME: Load-balance cursor repository, one row per task
//! ABOUTME: Backs the round-robin, weighted, and sticky strategies

use cf_core::{time::utc_now, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Persisted per-task selection state
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LbCursor {
    pub task_id: String,
    pub last_executor_id: Option<String>,
    pub rr_index: i64,
    pub sticky_executor_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Cursor repository
pub struct CursorRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> CursorRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Load the cursor for a task, creating a zeroed row on first use
    pub async fn get_or_create(&self, task_id: &str) -> Result<LbCursor> {
        let cursor = sqlx::query_as::<_, LbCursor>(
            r#"
            INSERT INTO lb_cursors (task_id, rr_index, updated_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (task_id) DO UPDATE SET task_id = EXCLUDED.task_id
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(utc_now())
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load balance cursor: {}", e)))?;
        Ok(cursor)
    }

    /// Persist the cursor after a selection
    pub async fn save(&self, cursor: &LbCursor) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE lb_cursors
            SET last_executor_id = $2, rr_index = $3, sticky_executor_id = $4, updated_at = $5
            WHERE task_id = $1
            "#,
        )
        .bind(&cursor.task_id)
        .bind(&cursor.last_executor_id)
        .bind(cursor.rr_index)
        .bind(&cursor.sticky_executor_id)
        .bind(utc_now())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to save balance cursor: {}", e)))?;
        Ok(())
    }
}
