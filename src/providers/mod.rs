pub mod application;
pub mod base;
pub mod breaker;
pub mod health;
pub mod intercept;
pub mod loader;
pub mod sources;

use crate::model::{Resource, ResourceType};
use async_trait::async_trait;
use miette::Diagnostic;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("loader `{0}` has not produced a snapshot yet")]
    #[diagnostic(code(gatehouse::provider::no_snapshot))]
    NoSnapshot(String),

    #[error("loader `{loader}` failed: {message}")]
    #[diagnostic(code(gatehouse::provider::load))]
    Load { loader: String, message: String },
}

/// Serves the materialized resource set of one resource type in three
/// views. Implementations wrap a cached loader and post-process its
/// snapshot.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// The full post-processed set.
    async fn all(&self) -> Result<Vec<Resource>, ProviderError>;

    /// Entries with a non-empty permission map that the given roles (or an
    /// admin) may access.
    async fn all_restricted(
        &self,
        roles: &BTreeSet<String>,
        is_admin: bool,
    ) -> Result<Vec<Resource>, ProviderError>;

    /// Entries with an empty permission map.
    async fn all_unrestricted(&self) -> Result<Vec<Resource>, ProviderError>;

    /// Case-insensitive lookup by name in the full set.
    async fn get_by_name(&self, name: &str) -> Result<Option<Resource>, ProviderError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(name)))
    }
}

/// Entries whose permission map names at least one group, kept when the
/// caller is an admin or shares a group with the map.
pub(crate) fn filter_restricted(
    resources: &[Resource],
    roles: &BTreeSet<String>,
    is_admin: bool,
) -> Vec<Resource> {
    resources
        .iter()
        .filter(|resource| {
            let Some(permissions) = resource.permissions() else {
                return false;
            };
            if !permissions.is_restricted() {
                return false;
            }
            is_admin
                || permissions
                    .all_groups()
                    .iter()
                    .any(|group| roles.contains(group))
        })
        .cloned()
        .collect()
}

/// Entries with an empty permission map.
pub(crate) fn filter_unrestricted(resources: &[Resource]) -> Vec<Resource> {
    resources
        .iter()
        .filter(|resource| {
            resource
                .permissions()
                .map(|permissions| !permissions.is_restricted())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}
