use gatehouse::model::{
    Account, Application, Authorization, Permissions, Role, RoleSource, ServiceAccount,
    UserPermission, UNRESTRICTED_USERNAME,
};

pub fn permissions(pairs: &[(Authorization, &[&str])]) -> Permissions {
    let mut builder = Permissions::builder();
    for (authorization, groups) in pairs {
        builder = builder.add(*authorization, groups.iter().copied());
    }
    builder.build()
}

pub fn account(name: &str, pairs: &[(Authorization, &[&str])]) -> Account {
    Account {
        name: name.to_string(),
        cloud_providers: vec![],
        permissions: permissions(pairs),
    }
}

pub fn application(name: &str, pairs: &[(Authorization, &[&str])]) -> Application {
    Application {
        name: name.to_string(),
        permissions: permissions(pairs),
    }
}

pub fn service_account(name: &str, member_of: &[&str]) -> ServiceAccount {
    ServiceAccount {
        name: name.to_string(),
        member_of: member_of.iter().map(|s| s.to_string()).collect(),
    }
}

/// A user permission with the given roles and one restricted account
/// named after the user.
pub fn user_with_roles(id: &str, role_names: &[&str]) -> UserPermission {
    let mut permission =
        UserPermission::new(id).with_roles(role_names.iter().map(|name| Role::new(name)));
    permission.accounts.insert(account(
        &format!("{id}-account"),
        &[(Authorization::Read, role_names)],
    ));
    permission
}

pub fn user_with_sourced_roles(id: &str, roles: &[(&str, RoleSource)]) -> UserPermission {
    UserPermission::new(id).with_roles(
        roles
            .iter()
            .map(|(name, source)| Role::with_source(name, *source)),
    )
}

pub fn unrestricted_with_account(account_name: &str) -> UserPermission {
    let mut permission = UserPermission::new(UNRESTRICTED_USERNAME);
    permission.accounts.insert(account(account_name, &[]));
    permission
}
