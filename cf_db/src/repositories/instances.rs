//! ABOUTME: Scheduler instance registry repository
//! ABOUTME: One row per replica; is_leader mirrors the advisory lock

use cf_core::{time::utc_now, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// A scheduler replica as seen by the cluster
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SchedulerInstance {
    pub id: String,
    pub instance_id: String,
    pub host: String,
    pub port: i32,
    pub is_leader: bool,
    pub registered_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Instance registry repository
pub struct InstanceRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> InstanceRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Register this replica, refreshing an existing row on restart
    pub async fn upsert(&self, instance_id: &str, host: &str, port: u16) -> Result<SchedulerInstance> {
        let id = Id::new().to_string();
        let now = utc_now();

        let instance = sqlx::query_as::<_, SchedulerInstance>(
            r#"
            INSERT INTO scheduler_instances (id, instance_id, host, port, is_leader, registered_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, FALSE, $5, $5)
            ON CONFLICT (instance_id) DO UPDATE SET
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                is_leader = FALSE,
                heartbeat_at = EXCLUDED.heartbeat_at
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(instance_id)
        .bind(host)
        .bind(port as i32)
        .bind(now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to register instance: {}", e)))?;

        Ok(instance)
    }

    /// Toggle the leader flag and refresh the heartbeat timestamp
    pub async fn set_leader(&self, instance_id: &str, is_leader: bool) -> Result<()> {
        sqlx::query(
            "UPDATE scheduler_instances SET is_leader = $2, heartbeat_at = $3 WHERE instance_id = $1",
        )
        .bind(instance_id)
        .bind(is_leader)
        .bind(utc_now())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update leader flag: {}", e)))?;
        Ok(())
    }

    /// All known replicas
    pub async fn list(&self) -> Result<Vec<SchedulerInstance>> {
        let instances = sqlx::query_as::<_, SchedulerInstance>(
            "SELECT * FROM scheduler_instances ORDER BY instance_id",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list instances: {}", e)))?;
        Ok(instances)
    }
}
