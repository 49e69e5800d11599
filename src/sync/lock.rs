use crate::repository::RepositoryError;
use chrono::Utc;
use rand::RngCore;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use std::time::Duration;
use tracing::debug;

/// Lease semantics for the fleet-wide lock: at most one holder until the
/// lease expires, and no re-acquisition before the success (or failure)
/// interval has elapsed after release.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub name: String,
    pub max_duration: Duration,
    pub success_interval: Duration,
    pub failure_interval: Duration,
}

/// Distributed lock over a relational lease row. Acquisition is a single
/// guarded upsert, so two instances racing for the same name cannot both
/// win.
pub struct SyncLock {
    db: DatabaseConnection,
    owner: String,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn owner_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SyncLock {
    pub fn new(db: DatabaseConnection) -> Self {
        SyncLock {
            db,
            owner: owner_token(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to take the lease. Returns false when another instance holds
    /// it, or the interval gate from the previous run has not yet passed.
    pub async fn acquire(&self, options: &LockOptions) -> Result<bool, RepositoryError> {
        let now = now_millis();
        let expires_at = now + options.max_duration.as_millis() as i64;

        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                r#"INSERT INTO sync_locks (name, owner, expires_at, not_before) VALUES (?, ?, ?, 0)
                   ON CONFLICT(name) DO UPDATE
                   SET owner = excluded.owner, expires_at = excluded.expires_at
                   WHERE sync_locks.expires_at < ? AND sync_locks.not_before <= ?"#,
                [
                    options.name.clone().into(),
                    self.owner.clone().into(),
                    expires_at.into(),
                    now.into(),
                    now.into(),
                ],
            ))
            .await?;

        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "SELECT owner, expires_at FROM sync_locks WHERE name = ?",
                [options.name.clone().into()],
            ))
            .await?;

        let acquired = match row {
            Some(row) => {
                let owner: String = row.try_get("", "owner")?;
                let expires: i64 = row.try_get("", "expires_at")?;
                owner == self.owner && expires > now
            }
            None => false,
        };
        debug!(lock = %options.name, acquired, "sync lock acquisition attempt");
        Ok(acquired)
    }

    /// Free the lease and arm the next-run gate: the success interval
    /// after a clean run, the failure interval otherwise.
    pub async fn release(
        &self,
        options: &LockOptions,
        success: bool,
    ) -> Result<(), RepositoryError> {
        let now = now_millis();
        let interval = if success {
            options.success_interval
        } else {
            options.failure_interval
        };
        let not_before = now + interval.as_millis() as i64;

        // expires_at of 0 frees the lease; not_before keeps the gate armed
        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "UPDATE sync_locks SET expires_at = 0, not_before = ? WHERE name = ? AND owner = ?",
                [
                    not_before.into(),
                    options.name.clone().into(),
                    self.owner.clone().into(),
                ],
            ))
            .await?;
        Ok(())
    }
}
