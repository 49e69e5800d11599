pub mod lock;

use crate::errors::GateError;
use crate::model::{Resource, RoleSource, UserPermission, UNRESTRICTED_USERNAME};
use crate::permissions::{PermissionsResolver, ResolutionError};
use crate::providers::health::HealthRegistry;
use crate::providers::{ProviderError, ResourceProvider};
use crate::repository::{PermissionsRepository, RepositoryError};
use crate::roles::ExternalUser;
use crate::settings::WriteMode;
use lock::{LockOptions, SyncLock};
use miette::Diagnostic;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub const SYNC_LOCK_NAME: &str = "gatehouse.userrolessyncer";

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Repository(#[from] RepositoryError),
}

impl SyncError {
    /// Provider and resolution failures are worth retrying inside a tick;
    /// repository failures already went through their own retry policy.
    fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Provider(_) | SyncError::Resolution(_))
    }
}

/// Periodic full-fleet sync: enumerate known users, re-resolve each, and
/// persist the results, all under the distributed lock so only one
/// instance runs at a time.
pub struct UserRolesSyncer {
    lock: SyncLock,
    repository: Arc<dyn PermissionsRepository>,
    resolver: Arc<PermissionsResolver>,
    service_accounts: Arc<dyn ResourceProvider>,
    health: Arc<HealthRegistry>,
    config: WriteMode,
    enabled: AtomicBool,
}

impl UserRolesSyncer {
    pub fn new(
        lock: SyncLock,
        repository: Arc<dyn PermissionsRepository>,
        resolver: Arc<PermissionsResolver>,
        service_accounts: Arc<dyn ResourceProvider>,
        health: Arc<HealthRegistry>,
        config: WriteMode,
    ) -> Self {
        UserRolesSyncer {
            lock,
            repository,
            resolver,
            service_accounts,
            health,
            config,
            enabled: AtomicBool::new(true),
        }
    }

    /// Deployment-environment lifecycle hook: the syncer stays idle until
    /// the instance is in service.
    pub fn set_in_service(&self, in_service: bool) {
        info!(
            "user role syncing is {}",
            if in_service { "active" } else { "disabled" }
        );
        self.enabled.store(in_service, Ordering::SeqCst);
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions {
            name: SYNC_LOCK_NAME.to_string(),
            max_duration: Duration::from_millis(
                (self.config.sync_delay_ms + self.config.sync_delay_timeout_ms).max(0) as u64,
            ),
            success_interval: Duration::from_millis(self.config.sync_delay_ms.max(0) as u64),
            failure_interval: Duration::from_millis(
                self.config.sync_failure_delay_ms.max(0) as u64,
            ),
        }
    }

    /// One scheduler fire. Exits cleanly when scheduling is disabled or
    /// the lock is held elsewhere; the next fire retries.
    pub async fn tick(&self) {
        if self.config.sync_delay_ms < 0 || !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let options = self.lock_options();
        match self.lock.acquire(&options).await {
            Ok(true) => {
                let result = self.sync_and_count().await;
                let success = result.is_ok();
                match &result {
                    Ok(count) => info!(count, "user role sync tick complete"),
                    Err(err) => error!(error = %err, "user role sync tick failed"),
                }
                if let Err(err) = self.lock.release(&options, success).await {
                    warn!(error = %err, "failed to release sync lock");
                }
            }
            Ok(false) => debug!("sync lock held elsewhere; skipping tick"),
            Err(err) => warn!(error = %err, "failed to acquire sync lock"),
        }
    }

    /// The tick body: bounded fixed-interval retries on provider and
    /// resolution failures, within the lock's wall-clock budget.
    pub async fn sync_and_count(&self) -> Result<u64, SyncError> {
        let interval_ms = self.config.retry_interval_ms.max(1);
        let interval = Duration::from_millis(interval_ms as u64);
        let timeout = Duration::from_millis(self.config.sync_delay_timeout_ms.max(0) as u64);
        let max_attempts = self.config.sync_delay_timeout_ms.max(0) / interval_ms + 1;
        let deadline = Instant::now() + timeout;

        if !self.health.all_healthy() {
            warn!(
                "resource providers are currently unhealthy; permission sync \
                 will run against cached snapshots"
            );
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_sync().await {
                Ok(count) => return Ok(count),
                Err(err) if err.is_retryable() => {
                    if attempt >= max_attempts || Instant::now() + interval > deadline {
                        error!(error = %err, "unable to complete user permission sync");
                        return Err(err);
                    }
                    warn!(
                        error = %err,
                        wait_ms = interval.as_millis() as u64,
                        healthy = self.health.all_healthy(),
                        "user permission sync failed; retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_sync(&self) -> Result<u64, SyncError> {
        let mut combo: HashMap<String, UserPermission> = HashMap::new();
        // Seed the unrestricted id so an empty store still gets refreshed
        combo.insert(
            UNRESTRICTED_USERNAME.to_string(),
            UserPermission::new(UNRESTRICTED_USERNAME),
        );
        combo.extend(self.repository.get_all_by_id().await?);
        for resource in self.service_accounts.all().await? {
            if let Resource::ServiceAccount(account) = resource {
                let permission = UserPermission::from_service_account(&account);
                combo.insert(permission.id.clone(), permission);
            }
        }
        self.update_user_permissions(combo).await
    }

    async fn update_user_permissions(
        &self,
        mut by_id: HashMap<String, UserPermission>,
    ) -> Result<u64, SyncError> {
        if by_id.remove(UNRESTRICTED_USERNAME).is_some() {
            let unrestricted = self.resolver.resolve_unrestricted().await?;
            self.repository.put(&unrestricted).await?;
            info!("synced anonymous user permissions");
        }

        // EXTERNAL roles stored by a prior sync (or a caller) ride along
        // so the identity provider cannot silently drop them.
        let users: Vec<ExternalUser> = by_id
            .values()
            .map(|permission| ExternalUser {
                id: permission.id.clone(),
                external_roles: permission
                    .roles
                    .iter()
                    .filter(|role| role.source == Some(RoleSource::External))
                    .cloned()
                    .collect(),
            })
            .collect();

        let resolved = self.resolver.resolve_batch(&users).await?;
        let count = resolved.len() as u64;
        self.repository.put_all(resolved).await?;
        info!(count, "synced user permission records");
        Ok(count)
    }
}

/// Initialize and start the scheduler that fires the sync tick. Callers
/// skip this entirely in read-only deployments.
pub async fn init_scheduler(syncer: Arc<UserRolesSyncer>) -> Result<JobScheduler, GateError> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| GateError::Other(format!("Failed to create job scheduler: {e}")))?;

    let tick_job = Job::new_async("*/30 * * * * *", move |_uuid, _l| {
        let syncer = syncer.clone();
        Box::pin(async move {
            syncer.tick().await;
        })
    })
    .map_err(|e| GateError::Other(format!("Failed to create sync job: {e}")))?;

    scheduler
        .add(tick_job)
        .await
        .map_err(|e| GateError::Other(format!("Failed to add sync job: {e}")))?;

    scheduler
        .start()
        .await
        .map_err(|e| GateError::Other(format!("Failed to start job scheduler: {e}")))?;

    info!("job scheduler started");
    Ok(scheduler)
}
