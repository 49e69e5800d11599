use super::intercept::{apply_interceptors, ResourceInterceptor};
use super::loader::CachedLoader;
use super::sources::{combined_permissions, ResourcePermissionSource};
use super::{filter_restricted, filter_unrestricted, ProviderError, ResourceProvider};
use crate::model::{Resource, ResourceType};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Generic provider over one cached loader. Post-processing resolves each
/// resource's permission map through the configured sources and runs the
/// interceptor chain; the result is cached per snapshot generation behind
/// a short TTL.
pub struct BaseProvider {
    resource_type: ResourceType,
    loader: Arc<CachedLoader>,
    permission_sources: Vec<Arc<dyn ResourcePermissionSource>>,
    interceptors: Vec<Arc<dyn ResourceInterceptor>>,
    cache: moka::sync::Cache<u64, Arc<Vec<Resource>>>,
}

impl BaseProvider {
    pub fn new(loader: Arc<CachedLoader>, cache_ttl: Duration) -> Self {
        BaseProvider {
            resource_type: loader.resource_type(),
            loader,
            permission_sources: Vec::new(),
            interceptors: Vec::new(),
            cache: moka::sync::Cache::builder()
                .time_to_live(cache_ttl)
                .max_capacity(4)
                .build(),
        }
    }

    pub fn with_permission_sources(
        mut self,
        sources: Vec<Arc<dyn ResourcePermissionSource>>,
    ) -> Self {
        self.permission_sources = sources;
        self
    }

    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn ResourceInterceptor>>) -> Self {
        self.interceptors = interceptors;
        self
    }

    fn materialize(&self) -> Result<Arc<Vec<Resource>>, ProviderError> {
        let snapshot = self.loader.snapshot()?;
        if let Some(hit) = self.cache.get(&snapshot.generation) {
            return Ok(hit);
        }

        let mut resources = snapshot.resources.clone();
        if !self.permission_sources.is_empty() {
            for resource in &mut resources {
                let combined = combined_permissions(resource, &self.permission_sources);
                resource.set_permissions(combined);
            }
        }
        resources = apply_interceptors(&self.interceptors, &self.resource_type, resources);

        let materialized = Arc::new(resources);
        self.cache.insert(snapshot.generation, materialized.clone());
        Ok(materialized)
    }
}

#[async_trait]
impl ResourceProvider for BaseProvider {
    fn resource_type(&self) -> ResourceType {
        self.resource_type.clone()
    }

    async fn all(&self) -> Result<Vec<Resource>, ProviderError> {
        Ok(self.materialize()?.as_ref().clone())
    }

    async fn all_restricted(
        &self,
        roles: &BTreeSet<String>,
        is_admin: bool,
    ) -> Result<Vec<Resource>, ProviderError> {
        Ok(filter_restricted(&self.materialize()?, roles, is_admin))
    }

    async fn all_unrestricted(&self) -> Result<Vec<Resource>, ProviderError> {
        Ok(filter_unrestricted(&self.materialize()?))
    }
}
