use super::permissions::Permissions;
use super::resources::{
    Account, Application, BuildService, ExtensionResource, Resource, Role, RoleSource,
    ServiceAccount,
};
use super::types::Authorization;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reserved id of the anonymous/unrestricted record. Its permissions are
/// the minimum granted to any authenticated session; bulk operations never
/// delete it.
pub const UNRESTRICTED_USERNAME: &str = "__unrestricted_user__";

/// A user's effective permission set: the resources of each kind the user
/// may act upon, plus the admin flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub id: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub allow_access_to_unknown_applications: bool,
    #[serde(default)]
    pub accounts: BTreeSet<Account>,
    #[serde(default)]
    pub applications: BTreeSet<Application>,
    #[serde(default)]
    pub build_services: BTreeSet<BuildService>,
    #[serde(default)]
    pub service_accounts: BTreeSet<ServiceAccount>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub extensions: BTreeSet<ExtensionResource>,
}

impl UserPermission {
    pub fn new(id: &str) -> Self {
        UserPermission {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_unrestricted_user(&self) -> bool {
        self.id.eq_ignore_ascii_case(UNRESTRICTED_USERNAME)
    }

    /// A service account doubles as a user whose roles are its memberships.
    /// Those roles are tagged EXTERNAL so a sync preserves them instead of
    /// consulting the identity provider.
    pub fn from_service_account(account: &ServiceAccount) -> Self {
        let mut permission = UserPermission::new(&account.name);
        permission.roles = account
            .member_of
            .iter()
            .map(|name| Role::with_source(name, RoleSource::External))
            .collect();
        permission
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn add_resource(&mut self, resource: Resource) {
        match resource {
            Resource::Account(a) => {
                self.accounts.insert(a);
            }
            Resource::Application(a) => {
                self.applications.insert(a);
            }
            Resource::BuildService(b) => {
                self.build_services.insert(b);
            }
            Resource::ServiceAccount(s) => {
                self.service_accounts.insert(s);
            }
            Resource::Role(r) => {
                self.roles.insert(r);
            }
            Resource::Extension(e) => {
                self.extensions.insert(e);
            }
        }
    }

    pub fn add_resources(&mut self, resources: impl IntoIterator<Item = Resource>) {
        for resource in resources {
            self.add_resource(resource);
        }
    }

    /// Every owned resource, roles included, as the generic variant.
    pub fn all_resources(&self) -> Vec<Resource> {
        let mut all = Vec::new();
        all.extend(self.accounts.iter().cloned().map(Resource::Account));
        all.extend(self.applications.iter().cloned().map(Resource::Application));
        all.extend(
            self.build_services
                .iter()
                .cloned()
                .map(Resource::BuildService),
        );
        all.extend(
            self.service_accounts
                .iter()
                .cloned()
                .map(Resource::ServiceAccount),
        );
        all.extend(self.roles.iter().cloned().map(Resource::Role));
        all.extend(self.extensions.iter().cloned().map(Resource::Extension));
        all
    }

    /// Union the other permission's resource sets into this one and OR the
    /// admin flag.
    pub fn merge(&mut self, other: &UserPermission) {
        self.admin |= other.admin;
        self.allow_access_to_unknown_applications |= other.allow_access_to_unknown_applications;
        self.accounts.extend(other.accounts.iter().cloned());
        self.applications.extend(other.applications.iter().cloned());
        self.build_services
            .extend(other.build_services.iter().cloned());
        self.service_accounts
            .extend(other.service_accounts.iter().cloned());
        self.roles.extend(other.roles.iter().cloned());
        self.extensions.extend(other.extensions.iter().cloned());
    }

    pub fn role_names(&self) -> BTreeSet<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    /// The externally exposed projection: per resource only its name and
    /// the authorizations this user holds on it.
    pub fn to_view(&self) -> UserPermissionView {
        let groups = self.role_names();
        let admin = self.admin;

        let project = |permissions: Permissions, name: &str| -> ResourceView {
            let authorizations = if admin {
                Authorization::ALL.into_iter().collect()
            } else {
                permissions.get_authorizations(groups.iter().map(String::as_str))
            };
            ResourceView {
                name: name.to_string(),
                authorizations,
            }
        };

        UserPermissionView {
            name: self.id.clone(),
            admin,
            allow_access_to_unknown_applications: self.allow_access_to_unknown_applications,
            accounts: self
                .accounts
                .iter()
                .map(|a| project(a.permissions.clone(), &a.name))
                .collect(),
            applications: self
                .applications
                .iter()
                .map(|a| project(a.permissions.clone(), &a.name))
                .collect(),
            build_services: self
                .build_services
                .iter()
                .map(|b| project(b.permissions.clone(), &b.name))
                .collect(),
            service_accounts: self
                .service_accounts
                .iter()
                .map(|s| ServiceAccountView {
                    name: s.name.clone(),
                    member_of: s.member_of.clone(),
                })
                .collect(),
            extensions: self
                .extensions
                .iter()
                .map(|e| project(e.permissions.clone(), &e.name))
                .collect(),
            roles: groups.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub name: String,
    pub authorizations: BTreeSet<Authorization>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountView {
    pub name: String,
    pub member_of: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionView {
    pub name: String,
    pub admin: bool,
    pub allow_access_to_unknown_applications: bool,
    pub accounts: Vec<ResourceView>,
    pub applications: Vec<ResourceView>,
    pub build_services: Vec<ResourceView>,
    pub service_accounts: Vec<ServiceAccountView>,
    pub extensions: Vec<ResourceView>,
    pub roles: Vec<String>,
}
