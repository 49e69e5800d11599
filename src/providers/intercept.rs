use crate::model::{Authorization, Permissions, Resource, ResourceType};

/// Rewrites a provider's post-processed set. Interceptors that do not opt
/// in via `supports` are skipped silently.
pub trait ResourceInterceptor: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, resource_type: &ResourceType) -> bool;

    fn intercept(&self, resources: Vec<Resource>) -> Vec<Resource>;
}

/// Intersects every restricted permission map with {READ}: whoever held
/// any authorization keeps read access, everything else is stripped.
pub struct ReadOnlyInterceptor {
    types: Vec<ResourceType>,
}

impl ReadOnlyInterceptor {
    pub fn new(types: Vec<ResourceType>) -> Self {
        ReadOnlyInterceptor { types }
    }
}

impl ResourceInterceptor for ReadOnlyInterceptor {
    fn name(&self) -> &str {
        "read-only"
    }

    fn supports(&self, resource_type: &ResourceType) -> bool {
        self.types.contains(resource_type)
    }

    fn intercept(&self, resources: Vec<Resource>) -> Vec<Resource> {
        resources
            .into_iter()
            .map(|mut resource| {
                if let Some(permissions) = resource.permissions() {
                    if permissions.is_restricted() {
                        let read_only = Permissions::builder()
                            .add(
                                Authorization::Read,
                                permissions.all_groups().iter().map(String::as_str),
                            )
                            .build();
                        resource.set_permissions(read_only);
                    }
                }
                resource
            })
            .collect()
    }
}

/// Run the chain in order, honoring each interceptor's `supports` gate.
pub fn apply_interceptors(
    interceptors: &[std::sync::Arc<dyn ResourceInterceptor>],
    resource_type: &ResourceType,
    mut resources: Vec<Resource>,
) -> Vec<Resource> {
    for interceptor in interceptors {
        if interceptor.supports(resource_type) {
            resources = interceptor.intercept(resources);
        }
    }
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Account;
    use std::sync::Arc;

    fn account(name: &str, permissions: Permissions) -> Resource {
        Resource::Account(Account {
            name: name.to_string(),
            cloud_providers: vec![],
            permissions,
        })
    }

    #[test]
    fn test_read_only_strips_other_authorizations() {
        let interceptor = ReadOnlyInterceptor::new(vec![ResourceType::account()]);
        let input = vec![account(
            "prod",
            Permissions::builder()
                .add(Authorization::Write, ["g1"])
                .add(Authorization::Delete, ["g2"])
                .build(),
        )];

        let output = interceptor.intercept(input);
        let permissions = output[0].permissions().unwrap();
        assert_eq!(
            permissions.get(Authorization::Read).iter().collect::<Vec<_>>(),
            vec!["g1", "g2"]
        );
        assert!(permissions.get(Authorization::Write).is_empty());
        assert!(permissions.get(Authorization::Delete).is_empty());
    }

    #[test]
    fn test_read_only_leaves_unrestricted_untouched() {
        let interceptor = ReadOnlyInterceptor::new(vec![ResourceType::account()]);
        let output = interceptor.intercept(vec![account("open", Permissions::default())]);
        assert!(!output[0].permissions().unwrap().is_restricted());
    }

    #[test]
    fn test_chain_skips_unsupported() {
        let interceptor: Arc<dyn ResourceInterceptor> =
            Arc::new(ReadOnlyInterceptor::new(vec![ResourceType::application()]));
        let input = vec![account(
            "prod",
            Permissions::builder()
                .add(Authorization::Write, ["g1"])
                .build(),
        )];

        // Account type is not supported, so permissions survive intact
        let output = apply_interceptors(&[interceptor], &ResourceType::account(), input);
        assert!(!output[0]
            .permissions()
            .unwrap()
            .get(Authorization::Write)
            .is_empty());
    }
}
