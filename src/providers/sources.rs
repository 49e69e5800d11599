use crate::model::{Permissions, Resource};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("prefix expressions must end with `*`: `{0}`")]
pub struct InvalidPrefixError(pub String);

/// Contributes a permission map to resources it covers. A provider
/// combines the resource's declared rules with every configured source by
/// per-authorization union.
pub trait ResourcePermissionSource: Send + Sync {
    fn permissions_for(&self, resource: &Resource) -> Permissions;
}

/// Grants a fixed permission map to every resource whose name starts with
/// the configured prefix stem.
#[derive(Debug)]
pub struct PrefixPermissionSource {
    stem: String,
    permissions: Permissions,
}

impl PrefixPermissionSource {
    pub fn new(prefix: &str, permissions: Permissions) -> Result<Self, InvalidPrefixError> {
        let stem = prefix
            .strip_suffix('*')
            .ok_or_else(|| InvalidPrefixError(prefix.to_string()))?;
        Ok(PrefixPermissionSource {
            stem: stem.to_string(),
            permissions,
        })
    }
}

impl ResourcePermissionSource for PrefixPermissionSource {
    fn permissions_for(&self, resource: &Resource) -> Permissions {
        if resource.name().starts_with(&self.stem) {
            self.permissions.clone()
        } else {
            Permissions::unrestricted()
        }
    }
}

/// The resource's declared rules unioned with every source's contribution.
pub fn combined_permissions(
    resource: &Resource,
    sources: &[std::sync::Arc<dyn ResourcePermissionSource>],
) -> Permissions {
    let declared = resource.permissions().unwrap_or_default();
    let contributed: Vec<Permissions> = sources
        .iter()
        .map(|source| source.permissions_for(resource))
        .collect();
    Permissions::combine(std::iter::once(&declared).chain(contributed.iter()))
}
