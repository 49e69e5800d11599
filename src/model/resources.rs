use super::permissions::Permissions;
use super::types::{Authorization, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A cloud account from the account registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub cloud_providers: Vec<String>,
    #[serde(default)]
    pub permissions: Permissions,
}

/// An application from the application registry. Entries whose name ends
/// with `*` are prefix entries: they contribute permissions to matching
/// applications and never appear in a final resource set.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub permissions: Permissions,
}

impl Application {
    pub fn is_prefix_entry(&self) -> bool {
        self.name.ends_with('*')
    }

    /// The prefix without its trailing `*`, for prefix entries only.
    pub fn prefix_stem(&self) -> Option<&str> {
        self.name.strip_suffix('*')
    }
}

/// A build system master from the build-system registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildService {
    pub name: String,
    #[serde(default)]
    pub permissions: Permissions,
}

/// A service account. `member_of` lists the role names whose members may
/// act as the account; it doubles as the account's access rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub name: String,
    #[serde(default)]
    pub member_of: Vec<String>,
}

impl ServiceAccount {
    /// Membership-derived permissions: every authorization is granted to
    /// the `member_of` groups. Empty membership means unrestricted.
    pub fn derived_permissions(&self) -> Permissions {
        let mut builder = Permissions::builder();
        for authorization in Authorization::ALL {
            builder = builder.add(authorization, self.member_of.iter().map(String::as_str));
        }
        builder.build()
    }
}

/// Where a role membership was observed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleSource {
    External,
    File,
    Ldap,
    DirectoryService,
    TeamService,
}

/// A role (group membership) as named by the identity provider. Names are
/// lowercased; identity is the name alone, independent of source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RoleSource>,
}

impl Role {
    pub fn new(name: &str) -> Self {
        Role {
            name: name.trim().to_lowercase(),
            source: None,
        }
    }

    pub fn with_source(name: &str, source: RoleSource) -> Self {
        Role {
            name: name.trim().to_lowercase(),
            source: Some(source),
        }
    }
}

impl PartialEq for Role {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Role {}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl std::hash::Hash for Role {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A resource of a type registered at startup by an extension. The core
/// never inspects its fields beyond name and permissions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionResource {
    #[serde(skip, default = "ResourceType::extension")]
    pub resource_type: ResourceType,
    pub name: String,
    #[serde(default)]
    pub permissions: Permissions,
}

impl Default for ExtensionResource {
    fn default() -> Self {
        ExtensionResource {
            resource_type: ResourceType::extension(),
            name: String::new(),
            permissions: Permissions::default(),
        }
    }
}

/// The resource model: a tagged variant rather than a class hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Account(Account),
    Application(Application),
    BuildService(BuildService),
    ServiceAccount(ServiceAccount),
    Role(Role),
    Extension(ExtensionResource),
}

impl Resource {
    pub fn name(&self) -> &str {
        match self {
            Resource::Account(a) => &a.name,
            Resource::Application(a) => &a.name,
            Resource::BuildService(b) => &b.name,
            Resource::ServiceAccount(s) => &s.name,
            Resource::Role(r) => &r.name,
            Resource::Extension(e) => &e.name,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Account(_) => ResourceType::account(),
            Resource::Application(_) => ResourceType::application(),
            Resource::BuildService(_) => ResourceType::build_service(),
            Resource::ServiceAccount(_) => ResourceType::service_account(),
            Resource::Role(_) => ResourceType::role(),
            Resource::Extension(e) => e.resource_type.clone(),
        }
    }

    /// The permission map controlling access, for access-controlled kinds.
    /// Roles have no permission map of their own.
    pub fn permissions(&self) -> Option<Permissions> {
        match self {
            Resource::Account(a) => Some(a.permissions.clone()),
            Resource::Application(a) => Some(a.permissions.clone()),
            Resource::BuildService(b) => Some(b.permissions.clone()),
            Resource::ServiceAccount(s) => Some(s.derived_permissions()),
            Resource::Role(_) => None,
            Resource::Extension(e) => Some(e.permissions.clone()),
        }
    }

    /// Replace the declared permission map. No-op for kinds whose access
    /// rule is derived (service accounts) or absent (roles).
    pub fn set_permissions(&mut self, permissions: Permissions) {
        match self {
            Resource::Account(a) => a.permissions = permissions,
            Resource::Application(a) => a.permissions = permissions,
            Resource::BuildService(b) => b.permissions = permissions,
            Resource::Extension(e) => e.permissions = permissions,
            Resource::ServiceAccount(_) | Resource::Role(_) => {}
        }
    }

    /// Serialize the resource body as it is persisted. The type tag is
    /// stored out-of-band (column or key), never inside the body.
    pub fn to_body_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Resource::Account(a) => serde_json::to_string(a),
            Resource::Application(a) => serde_json::to_string(a),
            Resource::BuildService(b) => serde_json::to_string(b),
            Resource::ServiceAccount(s) => serde_json::to_string(s),
            Resource::Role(r) => serde_json::to_string(r),
            Resource::Extension(e) => serde_json::to_string(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("no factory registered for resource type `{0}`")]
    UnknownType(String),
    #[error("failed to parse resource body: {0}")]
    Body(#[from] serde_json::Error),
}

type Factory = Box<dyn Fn(&str, &str) -> Result<Resource, serde_json::Error> + Send + Sync>;

/// Maps resource types to body parsers. Both the relational and the
/// key-value body readers consult this registry; extension types register
/// at startup and are treated identically afterwards.
pub struct ResourceFactoryRegistry {
    factories: BTreeMap<ResourceType, Factory>,
}

impl ResourceFactoryRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = ResourceFactoryRegistry {
            factories: BTreeMap::new(),
        };
        registry.factories.insert(
            ResourceType::account(),
            Box::new(|name, body| {
                let mut account: Account = serde_json::from_str(body)?;
                if account.name.is_empty() {
                    account.name = name.to_string();
                }
                Ok(Resource::Account(account))
            }),
        );
        registry.factories.insert(
            ResourceType::application(),
            Box::new(|name, body| {
                let mut application: Application = serde_json::from_str(body)?;
                if application.name.is_empty() {
                    application.name = name.to_string();
                }
                Ok(Resource::Application(application))
            }),
        );
        registry.factories.insert(
            ResourceType::build_service(),
            Box::new(|name, body| {
                let mut service: BuildService = serde_json::from_str(body)?;
                if service.name.is_empty() {
                    service.name = name.to_string();
                }
                Ok(Resource::BuildService(service))
            }),
        );
        registry.factories.insert(
            ResourceType::service_account(),
            Box::new(|name, body| {
                let mut account: ServiceAccount = serde_json::from_str(body)?;
                if account.name.is_empty() {
                    account.name = name.to_string();
                }
                Ok(Resource::ServiceAccount(account))
            }),
        );
        registry.factories.insert(
            ResourceType::role(),
            Box::new(|name, body| {
                let mut role: Role = serde_json::from_str(body)?;
                if role.name.is_empty() {
                    role.name = name.to_string();
                }
                role.name = role.name.to_lowercase();
                Ok(Resource::Role(role))
            }),
        );
        registry
    }

    /// Register an extension resource type. Its bodies parse into
    /// `ExtensionResource` carrying the type tag.
    pub fn register_extension(&mut self, resource_type: ResourceType) {
        let tag = resource_type.clone();
        self.factories.insert(
            resource_type,
            Box::new(move |name, body| {
                let mut resource: ExtensionResource = serde_json::from_str(body)?;
                resource.resource_type = tag.clone();
                if resource.name.is_empty() {
                    resource.name = name.to_string();
                }
                Ok(Resource::Extension(resource))
            }),
        );
    }

    pub fn parse(
        &self,
        resource_type: &ResourceType,
        name: &str,
        body: &str,
    ) -> Result<Resource, FactoryError> {
        let factory = self
            .factories
            .get(resource_type)
            .ok_or_else(|| FactoryError::UnknownType(resource_type.name().to_string()))?;
        Ok(factory(name, body)?)
    }

    pub fn types(&self) -> Vec<ResourceType> {
        self.factories.keys().cloned().collect()
    }
}
