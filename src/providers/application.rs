use super::intercept::{apply_interceptors, ResourceInterceptor};
use super::loader::CachedLoader;
use super::sources::{combined_permissions, ResourcePermissionSource};
use super::{filter_restricted, filter_unrestricted, ProviderError, ResourceProvider};
use crate::model::{Application, Authorization, Permissions, Resource, ResourceType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Applications come from two inventories and get extra post-processing:
/// prefix entries are folded into the applications they cover, and legacy
/// entries missing an EXECUTE rule inherit one from the configured
/// fallback authorization.
pub struct ApplicationProvider {
    primary: Arc<CachedLoader>,
    secondary: Option<Arc<CachedLoader>>,
    permission_sources: Vec<Arc<dyn ResourcePermissionSource>>,
    interceptors: Vec<Arc<dyn ResourceInterceptor>>,
    execute_fallback: Authorization,
    allow_access_to_unknown_applications: bool,
    cache: moka::sync::Cache<(u64, u64), Arc<Vec<Resource>>>,
}

impl ApplicationProvider {
    pub fn new(
        primary: Arc<CachedLoader>,
        secondary: Option<Arc<CachedLoader>>,
        execute_fallback: Authorization,
        allow_access_to_unknown_applications: bool,
        cache_ttl: Duration,
    ) -> Self {
        ApplicationProvider {
            primary,
            secondary,
            permission_sources: Vec::new(),
            interceptors: Vec::new(),
            execute_fallback,
            allow_access_to_unknown_applications,
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
        let primary = self.primary.snapshot()?;
        let secondary = match &self.secondary {
            Some(loader) => Some(loader.snapshot()?),
            None => None,
        };
        let key = (
            primary.generation,
            secondary.as_ref().map(|s| s.generation).unwrap_or(0),
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        // Union the inventories; the primary wins on name collision.
        let mut by_name: BTreeMap<String, Application> = BTreeMap::new();
        for resource in &primary.resources {
            if let Resource::Application(app) = resource {
                by_name.insert(app.name.to_lowercase(), app.clone());
            }
        }
        if let Some(secondary) = &secondary {
            for resource in &secondary.resources {
                if let Resource::Application(app) = resource {
                    by_name
                        .entry(app.name.to_lowercase())
                        .or_insert_with(|| app.clone());
                }
            }
        }
        let mut applications: Vec<Application> = by_name.into_values().collect();

        if !self.permission_sources.is_empty() {
            for application in &mut applications {
                let resource = Resource::Application(application.clone());
                application.permissions =
                    combined_permissions(&resource, &self.permission_sources);
            }
        }

        let mut applications = extract_prefix_permissions(applications);

        if self.allow_access_to_unknown_applications {
            // Unknown applications are implicitly granted, so entries with
            // no explicit permissions carry no information.
            applications.retain(|app| app.permissions.is_restricted());
        }

        for application in &mut applications {
            ensure_execute_permission(application, self.execute_fallback);
        }

        let resources: Vec<Resource> = applications
            .into_iter()
            .map(Resource::Application)
            .collect();
        let resources = apply_interceptors(
            &self.interceptors,
            &ResourceType::application(),
            resources,
        );

        let materialized = Arc::new(resources);
        self.cache.insert(key, materialized.clone());
        Ok(materialized)
    }
}

/// Fold every prefix entry's permissions into the applications it covers
/// by per-authorization union, then drop the prefix entries.
fn extract_prefix_permissions(applications: Vec<Application>) -> Vec<Application> {
    let (prefix_entries, mut entries): (Vec<Application>, Vec<Application>) = applications
        .into_iter()
        .partition(|app| app.is_prefix_entry());

    if prefix_entries.is_empty() {
        return entries;
    }

    for application in &mut entries {
        let matching: Vec<&Permissions> = prefix_entries
            .iter()
            .filter(|prefix| {
                prefix
                    .prefix_stem()
                    .is_some_and(|stem| application.name.starts_with(stem))
            })
            .map(|prefix| &prefix.permissions)
            .collect();
        if matching.is_empty() {
            continue;
        }
        application.permissions = Permissions::combine(
            matching
                .into_iter()
                .chain(std::iter::once(&application.permissions)),
        );
    }

    entries
}

/// Seed an empty EXECUTE group set from the fallback authorization.
/// Unrestricted entries are untouched.
fn ensure_execute_permission(application: &mut Application, fallback: Authorization) {
    if !application.permissions.is_restricted() {
        return;
    }
    if !application.permissions.get(Authorization::Execute).is_empty() {
        return;
    }
    let seed: Vec<String> = application
        .permissions
        .get(fallback)
        .iter()
        .cloned()
        .collect();
    if seed.is_empty() {
        return;
    }
    let mut builder = Permissions::builder();
    for (authorization, groups) in application.permissions.iter() {
        builder = builder.add(authorization, groups.iter().map(String::as_str));
    }
    builder = builder.add(Authorization::Execute, seed.iter().map(String::as_str));
    application.permissions = builder.build();
}

#[async_trait]
impl ResourceProvider for ApplicationProvider {
    fn resource_type(&self) -> ResourceType {
        ResourceType::application()
    }

    async fn all(&self) -> Result<Vec<Resource>, ProviderError> {
        Ok(self.materialize()?.as_ref().clone())
    }

    async fn all_restricted(
        &self,
        roles: &BTreeSet<String>,
        is_admin: bool,
    ) -> Result<Vec<Resource>, ProviderError> {
        if self.allow_access_to_unknown_applications {
            // Filtering is incompatible with implicit grants; return the
            // full set and let the view layer authorize per request.
            return self.all().await;
        }
        Ok(filter_restricted(&self.materialize()?, roles, is_admin))
    }

    async fn all_unrestricted(&self) -> Result<Vec<Resource>, ProviderError> {
        if self.allow_access_to_unknown_applications {
            return self.all().await;
        }
        Ok(filter_unrestricted(&self.materialize()?))
    }
}
