use super::{PermissionsRepository, RepositoryError, UNRESTRICTED_USERNAME};
use crate::model::UserPermission;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

/// Map-backed repository for tests and single-node deployments. Merging
/// the unrestricted record is a map lookup here, so no cache fronts it.
#[derive(Default)]
pub struct InMemoryPermissionsRepository {
    records: DashMap<String, UserPermission>,
}

impl InMemoryPermissionsRepository {
    pub fn new() -> Self {
        InMemoryPermissionsRepository::default()
    }

    fn unrestricted(&self) -> Option<UserPermission> {
        self.records
            .get(UNRESTRICTED_USERNAME)
            .map(|entry| entry.value().clone())
    }

    fn merged(&self, id: &str) -> Option<UserPermission> {
        let mut permission = self.records.get(id).map(|entry| entry.value().clone())?;
        if !permission.is_unrestricted_user() {
            if let Some(unrestricted) = self.unrestricted() {
                permission.merge(&unrestricted);
            }
        }
        Some(permission)
    }
}

#[async_trait]
impl PermissionsRepository for InMemoryPermissionsRepository {
    async fn put(&self, permission: &UserPermission) -> Result<(), RepositoryError> {
        self.records
            .insert(permission.id.clone(), permission.clone());
        Ok(())
    }

    async fn put_all(
        &self,
        permissions: HashMap<String, UserPermission>,
    ) -> Result<(), RepositoryError> {
        for permission in permissions.values() {
            self.put(permission).await?;
        }
        self.records.retain(|id, _| {
            id == UNRESTRICTED_USERNAME || permissions.contains_key(id)
        });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserPermission>, RepositoryError> {
        Ok(self.merged(id))
    }

    async fn get_all_by_id(&self) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let ids: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.merged(&id).map(|p| (id, p)))
            .collect())
    }

    async fn get_all_by_roles(
        &self,
        any_roles: Option<&[String]>,
    ) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let roles = match any_roles {
            None => return self.get_all_by_id().await,
            Some(roles) => roles,
        };

        let mut result = HashMap::new();
        if let Some(unrestricted) = self.unrestricted() {
            result.insert(UNRESTRICTED_USERNAME.to_string(), unrestricted);
        }
        if roles.is_empty() {
            return Ok(result);
        }

        let wanted: Vec<String> = roles.iter().map(|r| r.to_lowercase()).collect();
        let holders: Vec<String> = self
            .records
            .iter()
            .filter(|entry| {
                entry.key() != UNRESTRICTED_USERNAME
                    && entry.roles.iter().any(|role| wanted.contains(&role.name))
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in holders {
            if let Some(merged) = self.merged(&id) {
                result.insert(id, merged);
            }
        }
        Ok(result)
    }

    async fn remove(&self, id: &str) -> Result<(), RepositoryError> {
        self.records.remove(id);
        Ok(())
    }
}
