use crate::model::{Role, RoleSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("roles parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Source(String),
}

/// A user handed to the resolver together with roles that did not come
/// from the identity provider (EXTERNAL roles stored by a prior sync, or
/// roles supplied by a caller).
#[derive(Debug, Clone, Default)]
pub struct ExternalUser {
    pub id: String,
    pub external_roles: Vec<Role>,
}

impl ExternalUser {
    pub fn new(id: &str) -> Self {
        ExternalUser {
            id: id.to_string(),
            external_roles: Vec::new(),
        }
    }

    pub fn with_external_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.external_roles = roles.into_iter().collect();
        self
    }
}

/// Group memberships as named by the identity provider. Role names are
/// lowercased before they go anywhere near persistence. An empty list
/// means "member of nothing"; an unknown user is an absent key in the
/// batch result.
#[async_trait]
pub trait UserRolesProvider: Send + Sync {
    async fn load_roles(&self, user_id: &str) -> Result<Vec<Role>, RolesError>;

    async fn multi_load_roles(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<Role>>, RolesError>;
}

#[derive(Debug, Deserialize)]
struct RolesFile {
    users: HashMap<String, Vec<String>>,
}

/// Reference identity-provider client backed by a JSON file mapping user
/// ids to group names. Production directory clients implement the same
/// trait elsewhere.
pub struct FileRolesProvider {
    path: PathBuf,
}

impl FileRolesProvider {
    pub fn new(path: PathBuf) -> Self {
        FileRolesProvider { path }
    }

    async fn read(&self) -> Result<HashMap<String, Vec<Role>>, RolesError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let file: RolesFile = serde_json::from_str(&content)?;
        Ok(file
            .users
            .into_iter()
            .map(|(id, groups)| {
                let roles = groups
                    .iter()
                    .map(|name| Role::with_source(name, RoleSource::File))
                    .collect();
                (id.to_lowercase(), roles)
            })
            .collect())
    }
}

#[async_trait]
impl UserRolesProvider for FileRolesProvider {
    async fn load_roles(&self, user_id: &str) -> Result<Vec<Role>, RolesError> {
        let all = self.read().await?;
        Ok(all.get(&user_id.to_lowercase()).cloned().unwrap_or_default())
    }

    async fn multi_load_roles(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<Role>>, RolesError> {
        let mut all = self.read().await?;
        Ok(user_ids
            .iter()
            .filter_map(|id| {
                let key = id.to_lowercase();
                all.remove(&key).map(|roles| (key, roles))
            })
            .collect())
    }
}
