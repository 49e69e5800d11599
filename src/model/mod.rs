pub mod permissions;
pub mod resources;
pub mod types;
pub mod user_permission;

pub use permissions::Permissions;
pub use resources::{
    Account, Application, BuildService, ExtensionResource, Resource, ResourceFactoryRegistry,
    Role, RoleSource, ServiceAccount,
};
pub use types::{Authorization, ResourceType};
pub use user_permission::{
    ResourceView, ServiceAccountView, UserPermission, UserPermissionView, UNRESTRICTED_USERNAME,
};
