//! ABOUTME: Leader lock over the Postgres advisory-lock primitive
//! ABOUTME: Session-scoped; losing the connection releases the lock

use cf_core::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one acquisition round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Held,
    NotHeld,
}

/// Distributed leader lock backed by `pg_advisory_lock`.
///
/// Holds one dedicated connection for its whole lifetime. The lock is bound
/// to that session: if the connection dies, Postgres releases the lock and
/// `renew` reports it lost.
pub struct LeaderLock {
    conn: PoolConnection<Postgres>,
    key_name: String,
    key: i32,
}

impl LeaderLock {
    /// Detach a connection from the pool and derive the numeric lock key
    /// from the configured name.
    pub async fn connect(pool: &PgPool, key_name: &str) -> Result<Self> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| Error::Database(format!("Failed to acquire lock connection: {}", e)))?;

        // hashtext gives a stable int4; mask the sign bit so the value fits
        // the (classid, objid) advisory form and pg_locks.objid.
        let row = sqlx::query("SELECT hashtext($1) & 2147483647 AS key")
            .bind(key_name)
            .fetch_one(conn.as_mut())
            .await
            .map_err(|e| Error::Database(format!("Failed to derive lock key: {}", e)))?;
        let key: i32 = row
            .try_get("key")
            .map_err(|e| Error::Database(format!("Failed to read lock key: {}", e)))?;

        debug!(key_name = %key_name, key = key, "Leader lock session established");

        Ok(Self {
            conn,
            key_name: key_name.to_string(),
            key,
        })
    }

    /// Attempt to take the lock, retrying at one-second intervals until
    /// `timeout` lapses. Not holding the lock is a normal outcome.
    pub async fn try_acquire(&mut self, timeout: Duration) -> Result<AcquireOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let row = sqlx::query("SELECT pg_try_advisory_lock(0, $1) AS locked")
                .bind(self.key)
                .fetch_one(self.conn.as_mut())
                .await
                .map_err(|e| Error::Database(format!("Lock acquisition failed: {}", e)))?;
            let locked: bool = row
                .try_get("locked")
                .map_err(|e| Error::Database(format!("Lock acquisition failed: {}", e)))?;

            if locked {
                info!(key = %self.key_name, "Acquired leader lock");
                return Ok(AcquireOutcome::Held);
            }

            if tokio::time::Instant::now() + Duration::from_secs(1) > deadline {
                return Ok(AcquireOutcome::NotHeld);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Liveness probe on the holding session: ping, then verify the advisory
    /// lock is still granted to this backend. Any failure means lost.
    pub async fn renew(&mut self) -> Result<bool> {
        if let Err(e) = sqlx::query("SELECT 1").execute(self.conn.as_mut()).await {
            warn!(key = %self.key_name, "Leader lock session ping failed: {}", e);
            return Ok(false);
        }

        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND granted
                  AND classid = 0
                  AND objid = $1::oid
                  AND pid = pg_backend_pid()
            ) AS held
            "#,
        )
        .bind(self.key)
        .fetch_one(self.conn.as_mut())
        .await
        .map_err(|e| Error::Database(format!("Lock renewal check failed: {}", e)))?;

        let held: bool = row
            .try_get("held")
            .map_err(|e| Error::Database(format!("Lock renewal check failed: {}", e)))?;

        if !held {
            warn!(key = %self.key_name, "Leader lock no longer held by this session");
        }
        Ok(held)
    }

    /// Release the lock explicitly. Dropping the connection has the same
    /// effect because the lock is session-scoped.
    pub async fn release(&mut self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock(0, $1)")
            .bind(self.key)
            .execute(self.conn.as_mut())
            .await
            .map_err(|e| Error::Database(format!("Lock release failed: {}", e)))?;
        info!(key = %self.key_name, "Released leader lock");
        Ok(())
    }
}

impl std::fmt::Debug for LeaderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderLock")
            .field("key_name", &self.key_name)
            .field("key", &self.key)
            .finish()
    }
}
