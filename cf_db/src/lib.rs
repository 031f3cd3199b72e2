//! ABOUTME: Database layer with Postgres, migrations, and repositories
//! ABOUTME: Handles all data persistence and the advisory leader lock

use cf_core::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

pub mod leader;
pub mod repositories;

pub use leader::LeaderLock;
pub use repositories::*;

/// Database connection retry configuration
#[derive(Debug, Clone)]
pub struct DatabaseRetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
}

impl Default for DatabaseRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl DatabaseRetryConfig {
    /// Calculate delay for a given attempt number with exponential backoff
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Connection pool sizing passed through from configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_conns: u32,
    pub min_conns: u32,
    pub conn_max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 10,
            min_conns: 1,
            conn_max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect with migrations and default retry configuration
    pub async fn connect(database_url: &str, pool_config: PoolConfig) -> Result<Self> {
        Self::connect_with_retry(database_url, pool_config, DatabaseRetryConfig::default()).await
    }

    /// Connect with migrations and custom retry configuration
    pub async fn connect_with_retry(
        database_url: &str,
        pool_config: PoolConfig,
        retry_config: DatabaseRetryConfig,
    ) -> Result<Self> {
        info!(
            max_attempts = retry_config.max_attempts,
            max_conns = pool_config.max_conns,
            "Initializing database connection pool"
        );

        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                let delay = retry_config.calculate_delay(attempt - 1);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = retry_config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Database connection failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }

            let connect_result = PgPoolOptions::new()
                .max_connections(pool_config.max_conns)
                .min_connections(pool_config.min_conns)
                .max_lifetime(pool_config.conn_max_lifetime)
                .connect(database_url)
                .await;

            match connect_result {
                Ok(pool) => {
                    let db = Self { pool };
                    db.migrate().await?;
                    info!("Database initialized successfully");
                    return Ok(db);
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Database(format!(
            "Failed to connect after {} attempts: {}",
            retry_config.max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }

    /// Wrap an existing pool (used by tests and embedded setups)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verify the database is reachable
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Create the schema if it does not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
        }
        info!("Database schema is up to date");
        Ok(())
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        cron_expr TEXT NOT NULL,
        parameters JSONB NOT NULL DEFAULT '{}'::jsonb,
        execution_mode TEXT NOT NULL DEFAULT 'parallel',
        lb_strategy TEXT NOT NULL DEFAULT 'round_robin',
        max_retry INTEGER NOT NULL DEFAULT 0,
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executors (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        instance_id TEXT NOT NULL UNIQUE,
        base_url TEXT NOT NULL,
        health_url TEXT,
        status TEXT NOT NULL DEFAULT 'online',
        is_healthy BOOLEAN NOT NULL DEFAULT TRUE,
        failure_count INTEGER NOT NULL DEFAULT 0,
        last_health_check TIMESTAMPTZ,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_assignments (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        executor_name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        weight INTEGER NOT NULL DEFAULT 1,
        UNIQUE (task_id, executor_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        executor_id TEXT,
        scheduled_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        ended_at TIMESTAMPTZ,
        status TEXT NOT NULL DEFAULT 'pending',
        result JSONB,
        log TEXT NOT NULL DEFAULT '',
        retry_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lb_cursors (
        task_id TEXT PRIMARY KEY REFERENCES tasks (id) ON DELETE CASCADE,
        last_executor_id TEXT,
        rr_index BIGINT NOT NULL DEFAULT 0,
        sticky_executor_id TEXT,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_instances (
        id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL UNIQUE,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        is_leader BOOLEAN NOT NULL DEFAULT FALSE,
        registered_at TIMESTAMPTZ NOT NULL,
        heartbeat_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_executors_name ON executors (name)",
    "CREATE INDEX IF NOT EXISTS idx_executors_status ON executors (status)",
    "CREATE INDEX IF NOT EXISTS idx_assignments_task ON task_assignments (task_id)",
    "CREATE INDEX IF NOT EXISTS idx_assignments_name ON task_assignments (executor_name)",
    "CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task_id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status)",
    "CREATE INDEX IF NOT EXISTS idx_executions_scheduled ON executions (scheduled_at)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_backoff_and_cap() {
        let config = DatabaseRetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
        };

        assert_eq!(config.calculate_delay(0), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(2000));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(4000));
        // Capped at max_delay_ms
        assert_eq!(config.calculate_delay(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_schema_ddl_is_idempotent_sql() {
        for ddl in SCHEMA_DDL {
            assert!(ddl.contains("IF NOT EXISTS"), "DDL must be re-runnable: {}", ddl);
        }
    }
}
