use crate::model::{Resource, Role, UserPermission, UNRESTRICTED_USERNAME};
use crate::providers::{ProviderError, ResourceProvider};
use crate::roles::{ExternalUser, RolesError, UserRolesProvider};
use miette::Diagnostic;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Diagnostic)]
pub enum ResolutionError {
    #[error("failed to load roles for `{user}`")]
    #[diagnostic(code(gatehouse::resolve::roles))]
    Roles {
        user: String,
        #[source]
        source: RolesError,
    },

    #[error("failed to resolve permissions for `{user}`")]
    #[diagnostic(code(gatehouse::resolve::provider))]
    Provider {
        user: String,
        #[source]
        source: ProviderError,
    },
}

/// Joins roles and resources across all providers into per-user
/// permission sets.
pub struct PermissionsResolver {
    user_roles: Arc<dyn UserRolesProvider>,
    providers: Vec<Arc<dyn ResourceProvider>>,
    admin_roles: BTreeSet<String>,
    unrestricted_roles: Vec<String>,
    allow_access_to_unknown_applications: bool,
}

impl PermissionsResolver {
    pub fn new(
        user_roles: Arc<dyn UserRolesProvider>,
        providers: Vec<Arc<dyn ResourceProvider>>,
        admin_roles: &[String],
        unrestricted_roles: &[String],
    ) -> Self {
        PermissionsResolver {
            user_roles,
            providers,
            admin_roles: admin_roles.iter().map(|r| r.to_lowercase()).collect(),
            unrestricted_roles: unrestricted_roles.to_vec(),
            allow_access_to_unknown_applications: false,
        }
    }

    /// Resolved permissions carry this policy flag so the view layer can
    /// implicitly grant applications the inventory does not know.
    pub fn with_allow_unknown_applications(mut self, allow: bool) -> Self {
        self.allow_access_to_unknown_applications = allow;
        self
    }

    fn load_unrestricted_roles(&self) -> BTreeSet<Role> {
        self.unrestricted_roles
            .iter()
            .map(|name| Role::new(name))
            .collect()
    }

    /// Build the anonymous record: everything unrestricted, plus whatever
    /// the configured anonymous roles grant.
    pub async fn resolve_unrestricted(&self) -> Result<UserPermission, ResolutionError> {
        let roles = self.load_unrestricted_roles();
        self.build_permission(UNRESTRICTED_USERNAME, roles).await
    }

    pub async fn resolve(&self, user_id: &str) -> Result<UserPermission, ResolutionError> {
        self.resolve_and_merge(&ExternalUser::new(user_id)).await
    }

    /// Provider roles unioned with the caller-supplied external roles.
    pub async fn resolve_and_merge(
        &self,
        user: &ExternalUser,
    ) -> Result<UserPermission, ResolutionError> {
        debug!(user = %user.id, "loading roles");
        let roles = self
            .user_roles
            .load_roles(&user.id)
            .await
            .map_err(|source| ResolutionError::Roles {
                user: user.id.clone(),
                source,
            })?;
        debug!(user = %user.id, count = roles.len(), "loaded roles");

        let combo: BTreeSet<Role> = roles
            .into_iter()
            .chain(user.external_roles.iter().cloned())
            .collect();
        self.build_permission(&user.id, combo).await
    }

    async fn build_permission(
        &self,
        user_id: &str,
        roles: BTreeSet<Role>,
    ) -> Result<UserPermission, ResolutionError> {
        let role_names: BTreeSet<String> = roles.iter().map(|r| r.name.clone()).collect();
        let is_admin = role_names.iter().any(|r| self.admin_roles.contains(r));

        let mut permission = UserPermission::new(user_id).with_roles(roles);
        permission.admin = is_admin;
        permission.allow_access_to_unknown_applications =
            self.allow_access_to_unknown_applications;

        let anonymous = user_id.eq_ignore_ascii_case(UNRESTRICTED_USERNAME);
        for provider in &self.providers {
            let wrap = |source| ResolutionError::Provider {
                user: user_id.to_string(),
                source,
            };
            if anonymous {
                permission.add_resources(provider.all_unrestricted().await.map_err(wrap)?);
                if !role_names.is_empty() {
                    permission.add_resources(
                        provider.all_restricted(&role_names, false).await.map_err(wrap)?,
                    );
                }
            } else if !role_names.is_empty() {
                permission.add_resources(
                    provider
                        .all_restricted(&role_names, is_admin)
                        .await
                        .map_err(wrap)?,
                );
            }
        }
        Ok(permission)
    }

    /// Batch path: one `multi_load_roles` call and a single group→resource
    /// index over every provider instead of per-user provider filtering.
    pub async fn resolve_batch(
        &self,
        users: &[ExternalUser],
    ) -> Result<HashMap<String, UserPermission>, ResolutionError> {
        let ids: Vec<String> = users.iter().map(|u| u.id.to_lowercase()).collect();
        let mut user_to_roles = self
            .user_roles
            .multi_load_roles(&ids)
            .await
            .map_err(|source| ResolutionError::Roles {
                user: "<batch>".to_string(),
                source,
            })?;

        // Every input user appears in the result, identity-provider hit or
        // not; external roles merge in per user.
        for user in users {
            user_to_roles
                .entry(user.id.to_lowercase())
                .or_default()
                .extend(user.external_roles.iter().cloned());
        }

        let acls = self.build_acls().await?;

        let mut resolved = HashMap::with_capacity(user_to_roles.len());
        for (id, roles) in user_to_roles {
            let roles: BTreeSet<Role> = roles.into_iter().collect();
            let role_names: BTreeSet<String> = roles.iter().map(|r| r.name.clone()).collect();
            let is_admin = role_names.iter().any(|r| self.admin_roles.contains(r));

            let mut permission = UserPermission::new(&id).with_roles(roles);
            permission.admin = is_admin;
            permission.allow_access_to_unknown_applications =
                self.allow_access_to_unknown_applications;
            if is_admin {
                permission.add_resources(acls.all_resources());
            } else {
                permission.add_resources(acls.can_access(&role_names));
            }
            resolved.insert(id, permission);
        }
        Ok(resolved)
    }

    async fn build_acls(&self) -> Result<AccessControlLists, ResolutionError> {
        let mut acls = AccessControlLists::default();
        for provider in &self.providers {
            let resources =
                provider
                    .all()
                    .await
                    .map_err(|source| ResolutionError::Provider {
                        user: "<batch>".to_string(),
                        source,
                    })?;
            for resource in resources {
                acls.add(resource);
            }
        }
        Ok(acls)
    }
}

/// The reverse index of restricted resources: group name → resources any
/// member of the group can access. Built per batch resolve and discarded.
#[derive(Default)]
struct AccessControlLists {
    by_group: HashMap<String, Vec<Resource>>,
}

impl AccessControlLists {
    fn add(&mut self, resource: Resource) {
        let Some(permissions) = resource.permissions() else {
            return;
        };
        for group in permissions.all_groups() {
            self.by_group
                .entry(group)
                .or_default()
                .push(resource.clone());
        }
    }

    fn can_access(&self, role_names: &BTreeSet<String>) -> Vec<Resource> {
        let mut accessible = BTreeSet::new();
        for role in role_names {
            if let Some(resources) = self.by_group.get(role) {
                accessible.extend(resources.iter().cloned());
            }
        }
        accessible.into_iter().collect()
    }

    fn all_resources(&self) -> Vec<Resource> {
        let mut all = BTreeSet::new();
        for resources in self.by_group.values() {
            all.extend(resources.iter().cloned());
        }
        all.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Account, Application, Authorization, Permissions, ResourceType, RoleSource,
        ServiceAccount,
    };
    use async_trait::async_trait;

    struct StubProvider {
        resource_type: ResourceType,
        resources: Vec<Resource>,
    }

    #[async_trait]
    impl ResourceProvider for StubProvider {
        fn resource_type(&self) -> ResourceType {
            self.resource_type.clone()
        }

        async fn all(&self) -> Result<Vec<Resource>, ProviderError> {
            Ok(self.resources.clone())
        }

        async fn all_restricted(
            &self,
            roles: &BTreeSet<String>,
            is_admin: bool,
        ) -> Result<Vec<Resource>, ProviderError> {
            Ok(crate::providers::filter_restricted(
                &self.resources,
                roles,
                is_admin,
            ))
        }

        async fn all_unrestricted(&self) -> Result<Vec<Resource>, ProviderError> {
            Ok(crate::providers::filter_unrestricted(&self.resources))
        }
    }

    struct StubRoles {
        users: HashMap<String, Vec<Role>>,
    }

    #[async_trait]
    impl UserRolesProvider for StubRoles {
        async fn load_roles(&self, user_id: &str) -> Result<Vec<Role>, RolesError> {
            Ok(self
                .users
                .get(&user_id.to_lowercase())
                .cloned()
                .unwrap_or_default())
        }

        async fn multi_load_roles(
            &self,
            user_ids: &[String],
        ) -> Result<HashMap<String, Vec<Role>>, RolesError> {
            Ok(user_ids
                .iter()
                .filter_map(|id| {
                    self.users
                        .get(&id.to_lowercase())
                        .map(|roles| (id.to_lowercase(), roles.clone()))
                })
                .collect())
        }
    }

    fn account(name: &str, pairs: &[(Authorization, &[&str])]) -> Resource {
        let mut builder = Permissions::builder();
        for (auth, groups) in pairs {
            builder = builder.add(*auth, groups.iter().copied());
        }
        Resource::Account(Account {
            name: name.to_string(),
            cloud_providers: vec![],
            permissions: builder.build(),
        })
    }

    fn resolver_with(
        users: HashMap<String, Vec<Role>>,
        providers: Vec<Arc<dyn ResourceProvider>>,
        admin_roles: &[String],
        unrestricted_roles: &[String],
    ) -> PermissionsResolver {
        PermissionsResolver::new(
            Arc::new(StubRoles { users }),
            providers,
            admin_roles,
            unrestricted_roles,
        )
    }

    fn account_provider() -> Arc<dyn ResourceProvider> {
        Arc::new(StubProvider {
            resource_type: ResourceType::account(),
            resources: vec![
                account("open", &[]),
                account("locked", &[(Authorization::Read, &["group1"])]),
                account(
                    "locked2",
                    &[(Authorization::Write, &["group2"])],
                ),
            ],
        })
    }

    #[tokio::test]
    async fn test_resolve_merges_provider_and_external_roles() {
        let users = HashMap::from([(
            "alice".to_string(),
            vec![Role::with_source("group1", RoleSource::Ldap)],
        )]);
        let resolver = resolver_with(users, vec![account_provider()], &[], &[]);

        let user = ExternalUser::new("alice")
            .with_external_roles([Role::with_source("group2", RoleSource::External)]);
        let permission = resolver.resolve_and_merge(&user).await.unwrap();

        assert_eq!(permission.roles.len(), 2);
        let names: Vec<&str> = permission.accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["locked", "locked2"]);
    }

    #[tokio::test]
    async fn test_resolve_user_without_roles_gets_nothing() {
        let resolver = resolver_with(HashMap::new(), vec![account_provider()], &[], &[]);
        let permission = resolver.resolve("nobody").await.unwrap();
        assert!(permission.accounts.is_empty());
        assert!(!permission.admin);
    }

    #[tokio::test]
    async fn test_resolve_admin_flag_from_configured_roles() {
        let users = HashMap::from([(
            "root".to_string(),
            vec![Role::new("platform_admins")],
        )]);
        let resolver = resolver_with(
            users,
            vec![account_provider()],
            &["Platform_Admins".to_string()],
            &[],
        );

        let permission = resolver.resolve("root").await.unwrap();
        assert!(permission.admin);
        // Admin sees every restricted account
        assert_eq!(permission.accounts.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_unrestricted_includes_unrestricted_resources() {
        let resolver = resolver_with(HashMap::new(), vec![account_provider()], &[], &[]);
        let permission = resolver.resolve_unrestricted().await.unwrap();
        assert_eq!(permission.id, UNRESTRICTED_USERNAME);
        let names: Vec<&str> = permission.accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["open"]);
    }

    #[tokio::test]
    async fn test_resolve_unrestricted_with_anonymous_roles() {
        let resolver = resolver_with(
            HashMap::new(),
            vec![account_provider()],
            &[],
            &["group1".to_string()],
        );
        let permission = resolver.resolve_unrestricted().await.unwrap();
        let names: Vec<&str> = permission.accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["locked", "open"]);
    }

    #[tokio::test]
    async fn test_batch_resolve_uses_index() {
        let users = HashMap::from([
            ("alice".to_string(), vec![Role::new("group1")]),
            ("bob".to_string(), vec![Role::new("group2")]),
        ]);
        let resolver = resolver_with(users, vec![account_provider()], &[], &[]);

        let batch = vec![ExternalUser::new("alice"), ExternalUser::new("bob")];
        let resolved = resolver.resolve_batch(&batch).await.unwrap();

        assert_eq!(resolved.len(), 2);
        let alice = &resolved["alice"];
        assert_eq!(
            alice.accounts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["locked"]
        );
        let bob = &resolved["bob"];
        assert_eq!(
            bob.accounts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["locked2"]
        );
    }

    #[tokio::test]
    async fn test_batch_resolve_service_account_roles_not_consulted() {
        // The service account is unknown to the identity provider; its
        // memberships arrive as external roles and still resolve.
        let sa = ServiceAccount {
            name: "ci@svc".to_string(),
            member_of: vec!["group1".to_string()],
        };
        let resolver = resolver_with(HashMap::new(), vec![account_provider()], &[], &[]);

        let batch = vec![ExternalUser::new("ci@svc").with_external_roles(
            UserPermission::from_service_account(&sa).roles,
        )];
        let resolved = resolver.resolve_batch(&batch).await.unwrap();
        let permission = &resolved["ci@svc"];
        assert_eq!(
            permission
                .accounts
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>(),
            vec!["locked"]
        );
    }

    #[tokio::test]
    async fn test_batch_resolve_admin_gets_every_indexed_resource() {
        let users = HashMap::from([(
            "root".to_string(),
            vec![Role::new("admins")],
        )]);
        let resolver = resolver_with(
            users,
            vec![account_provider()],
            &["admins".to_string()],
            &[],
        );

        let resolved = resolver
            .resolve_batch(&[ExternalUser::new("root")])
            .await
            .unwrap();
        assert_eq!(resolved["root"].accounts.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_application_policy_flag_carried() {
        let users = HashMap::from([("alice".to_string(), vec![Role::new("group1")])]);
        let resolver = resolver_with(users, vec![account_provider()], &[], &[])
            .with_allow_unknown_applications(true);

        let single = resolver.resolve("alice").await.unwrap();
        assert!(single.allow_access_to_unknown_applications);

        let batch = resolver
            .resolve_batch(&[ExternalUser::new("alice")])
            .await
            .unwrap();
        assert!(batch["alice"].allow_access_to_unknown_applications);
    }

    #[tokio::test]
    async fn test_batch_includes_applications_via_index() {
        let app_provider: Arc<dyn ResourceProvider> = Arc::new(StubProvider {
            resource_type: ResourceType::application(),
            resources: vec![Resource::Application(Application {
                name: "deployer".to_string(),
                permissions: Permissions::builder()
                    .add(Authorization::Execute, ["group1"])
                    .build(),
            })],
        });
        let users = HashMap::from([("alice".to_string(), vec![Role::new("group1")])]);
        let resolver = resolver_with(users, vec![account_provider(), app_provider], &[], &[]);

        let resolved = resolver
            .resolve_batch(&[ExternalUser::new("alice")])
            .await
            .unwrap();
        let alice = &resolved["alice"];
        assert_eq!(alice.applications.len(), 1);
        assert_eq!(alice.accounts.len(), 1);
    }
}
