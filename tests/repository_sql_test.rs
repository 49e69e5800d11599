mod helpers;

use gatehouse::model::{
    Authorization, ResourceFactoryRegistry, Role, RoleSource, UserPermission,
    UNRESTRICTED_USERNAME,
};
use gatehouse::repository::sql::SqlPermissionsRepository;
use gatehouse::repository::PermissionsRepository;
use helpers::builders::*;
use helpers::db::TestDb;
use sea_orm::{ConnectionTrait, Statement};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn repo(db: &TestDb) -> SqlPermissionsRepository {
    SqlPermissionsRepository::new(
        db.connection().clone(),
        Arc::new(ResourceFactoryRegistry::with_defaults()),
        Duration::from_secs(10),
    )
}

async fn resource_updated_at(db: &TestDb, resource_type: &str, name: &str) -> Option<i64> {
    db.connection()
        .query_one(Statement::from_sql_and_values(
            db.connection().get_database_backend(),
            "SELECT updated_at FROM resources WHERE resource_type = ? AND resource_name = ?",
            [resource_type.into(), name.into()],
        ))
        .await
        .unwrap()
        .and_then(|row| row.try_get::<Option<i64>>("", "updated_at").ok())
        .flatten()
}

async fn count_rows(db: &TestDb, table: &str) -> i64 {
    db.connection()
        .query_one(Statement::from_string(
            db.connection().get_database_backend(),
            format!("SELECT COUNT(*) AS n FROM {table}"),
        ))
        .await
        .unwrap()
        .map(|row| row.try_get::<i64>("", "n").unwrap())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let mut alice = UserPermission::new("alice").with_roles([Role::new("group1")]);
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["group1"])]));
    alice.applications.insert(application(
        "deployer",
        &[(Authorization::Execute, &["group1"])],
    ));
    alice.service_accounts.insert(service_account(
        "ci@svc",
        &["group1"],
    ));

    repo.put(&alice).await.unwrap();
    let stored = repo.get("alice").await.unwrap().unwrap();
    assert_eq!(stored.accounts, alice.accounts);
    assert_eq!(stored.applications, alice.applications);
    assert_eq!(stored.service_accounts, alice.service_accounts);
    assert_eq!(stored.roles, alice.roles);
    assert!(!stored.admin);
}

#[tokio::test]
async fn test_get_missing_user_is_none() {
    let db = TestDb::new().await;
    let repo = repo(&db);
    assert!(repo.get("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_is_idempotent_and_body_hash_stable() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let alice = user_with_roles("alice", &["group1"]);
    repo.put(&alice).await.unwrap();
    let first_stamp = resource_updated_at(&db, "ACCOUNT", "alice-account").await;
    assert!(first_stamp.is_some());

    // An identical second put must not touch any resource row
    tokio::time::sleep(Duration::from_millis(5)).await;
    repo.put(&alice).await.unwrap();
    let second_stamp = resource_updated_at(&db, "ACCOUNT", "alice-account").await;
    assert_eq!(first_stamp, second_stamp);

    assert_eq!(count_rows(&db, "users").await, 1);
    let stored = repo.get("alice").await.unwrap().unwrap();
    assert_eq!(stored.accounts.len(), 1);
}

#[tokio::test]
async fn test_changed_body_rewrites_resource() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let mut alice = UserPermission::new("alice");
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["group1"])]));
    repo.put(&alice).await.unwrap();
    let first_stamp = resource_updated_at(&db, "ACCOUNT", "prod").await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut changed = UserPermission::new("alice");
    changed
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["group1", "group2"])]));
    repo.put(&changed).await.unwrap();
    let second_stamp = resource_updated_at(&db, "ACCOUNT", "prod").await;
    assert!(second_stamp > first_stamp);
}

#[tokio::test]
async fn test_permission_rows_follow_resource_delta() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let mut alice = UserPermission::new("alice");
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["g"])]));
    alice
        .accounts
        .insert(account("staging", &[(Authorization::Read, &["g"])]));
    repo.put(&alice).await.unwrap();
    assert_eq!(count_rows(&db, "permissions").await, 2);

    // Drop one account, keep the other
    let mut smaller = UserPermission::new("alice");
    smaller
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["g"])]));
    repo.put(&smaller).await.unwrap();
    assert_eq!(count_rows(&db, "permissions").await, 1);

    let stored = repo.get("alice").await.unwrap().unwrap();
    assert_eq!(
        stored.accounts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        vec!["prod"]
    );
}

#[tokio::test]
async fn test_get_merges_unrestricted_record() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    repo.put(&unrestricted_with_account("shared")).await.unwrap();
    repo.put(&user_with_roles("alice", &["group1"])).await.unwrap();

    let alice = repo.get("alice").await.unwrap().unwrap();
    let names: Vec<&str> = alice.accounts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["alice-account", "shared"]);

    // The unrestricted id is returned as-is, not merged with itself
    let unrestricted = repo.get(UNRESTRICTED_USERNAME).await.unwrap().unwrap();
    assert_eq!(unrestricted.accounts.len(), 1);
}

#[tokio::test]
async fn test_put_all_prunes_orphans() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    repo.put(&unrestricted_with_account("shared")).await.unwrap();
    repo.put(&user_with_roles("alice", &["group1"])).await.unwrap();

    let incoming = HashMap::from([
        ("bob".to_string(), user_with_roles("bob", &["group2"])),
        ("carol".to_string(), user_with_roles("carol", &["group3"])),
    ]);
    repo.put_all(incoming).await.unwrap();

    // alice and her permission rows are gone; the unrestricted record stays
    assert!(repo.get("alice").await.unwrap().is_none());
    assert!(repo.get("bob").await.unwrap().is_some());
    assert!(repo.get("carol").await.unwrap().is_some());
    assert!(repo.get(UNRESTRICTED_USERNAME).await.unwrap().is_some());

    // alice's account resource is no longer referenced by anyone
    assert_eq!(resource_updated_at(&db, "ACCOUNT", "alice-account").await, None);
}

#[tokio::test]
async fn test_get_all_by_roles_null_empty_and_matching() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    repo.put(&unrestricted_with_account("shared")).await.unwrap();
    for (id, role) in [
        ("u1", "role1"),
        ("u2", "role2"),
        ("u3", "role3"),
        ("u4", "role4"),
        ("u5", "role5"),
    ] {
        repo.put(&user_with_roles(id, &[role])).await.unwrap();
    }

    let all = repo.get_all_by_roles(None).await.unwrap();
    assert_eq!(all.len(), 6);

    let only_unrestricted = repo.get_all_by_roles(Some(&[])).await.unwrap();
    assert_eq!(only_unrestricted.len(), 1);
    assert!(only_unrestricted.contains_key(UNRESTRICTED_USERNAME));

    let filtered = repo
        .get_all_by_roles(Some(&["role3".to_string(), "role4".to_string()]))
        .await
        .unwrap();
    let mut ids: Vec<&str> = filtered.keys().map(String::as_str).collect();
    ids.sort();
    assert_eq!(ids, vec![UNRESTRICTED_USERNAME, "u3", "u4"]);

    // Each match is merged with the unrestricted record
    assert!(filtered["u3"].accounts.iter().any(|a| a.name == "shared"));
    assert!(filtered["u3"].accounts.iter().any(|a| a.name == "u3-account"));
}

#[tokio::test]
async fn test_remove_deletes_user_but_not_resources() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let mut alice = UserPermission::new("alice");
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["g"])]));
    repo.put(&alice).await.unwrap();

    repo.remove("alice").await.unwrap();
    assert!(repo.get("alice").await.unwrap().is_none());
    assert_eq!(count_rows(&db, "permissions").await, 0);
    // Shared resources are left for the next putAll sweep
    assert!(resource_updated_at(&db, "ACCOUNT", "prod").await.is_some());
}

#[tokio::test]
async fn test_admin_flag_round_trips() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let mut root = user_with_roles("root", &["admins"]);
    root.admin = true;
    repo.put(&root).await.unwrap();

    let stored = repo.get("root").await.unwrap().unwrap();
    assert!(stored.admin);
}

#[tokio::test]
async fn test_external_role_source_survives_storage() {
    let db = TestDb::new().await;
    let repo = repo(&db);

    let user = user_with_sourced_roles(
        "u",
        &[("r_internal", RoleSource::File), ("r_external", RoleSource::External)],
    );
    repo.put(&user).await.unwrap();

    let stored = repo.get("u").await.unwrap().unwrap();
    let external: Vec<&Role> = stored
        .roles
        .iter()
        .filter(|r| r.source == Some(RoleSource::External))
        .collect();
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].name, "r_external");
}
