use super::{PermissionsRepository, RepositoryError};
use crate::model::UserPermission;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Migration aid: writes land in the primary backend while reads fall
/// back to the previous one until the fleet has been re-synced.
pub struct DualPermissionsRepository {
    primary: Arc<dyn PermissionsRepository>,
    previous: Arc<dyn PermissionsRepository>,
    fallback_reads: AtomicU64,
}

impl DualPermissionsRepository {
    pub fn new(
        primary: Arc<dyn PermissionsRepository>,
        previous: Arc<dyn PermissionsRepository>,
    ) -> Self {
        DualPermissionsRepository {
            primary,
            previous,
            fallback_reads: AtomicU64::new(0),
        }
    }

    /// Reads served by the previous backend since startup.
    pub fn fallback_reads(&self) -> u64 {
        self.fallback_reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PermissionsRepository for DualPermissionsRepository {
    async fn put(&self, permission: &UserPermission) -> Result<(), RepositoryError> {
        self.primary.put(permission).await
    }

    async fn put_all(
        &self,
        permissions: HashMap<String, UserPermission>,
    ) -> Result<(), RepositoryError> {
        self.primary.put_all(permissions).await
    }

    async fn get(&self, id: &str) -> Result<Option<UserPermission>, RepositoryError> {
        if let Some(permission) = self.primary.get(id).await? {
            return Ok(Some(permission));
        }
        let fallback = self.previous.get(id).await?;
        if fallback.is_some() {
            self.fallback_reads.fetch_add(1, Ordering::Relaxed);
            debug!(user = %id, "served permission from previous repository");
        }
        Ok(fallback)
    }

    async fn get_all_by_id(&self) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let mut result = self.previous.get_all_by_id().await?;
        // The primary wins on id collision
        result.extend(self.primary.get_all_by_id().await?);
        Ok(result)
    }

    async fn get_all_by_roles(
        &self,
        any_roles: Option<&[String]>,
    ) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let mut result = self.previous.get_all_by_roles(any_roles).await?;
        result.extend(self.primary.get_all_by_roles(any_roles).await?);
        Ok(result)
    }

    async fn remove(&self, id: &str) -> Result<(), RepositoryError> {
        self.primary.remove(id).await?;
        self.previous.remove(id).await?;
        Ok(())
    }
}
