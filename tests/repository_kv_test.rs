mod helpers;

use gatehouse::model::{
    Authorization, ResourceFactoryRegistry, UserPermission, UNRESTRICTED_USERNAME,
};
use gatehouse::repository::kv::{InMemoryKvStore, KvClient, KvPermissionsRepository};
use gatehouse::repository::PermissionsRepository;
use helpers::builders::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn repo_with_store() -> (KvPermissionsRepository, Arc<InMemoryKvStore>) {
    let store = Arc::new(InMemoryKvStore::new());
    let repo = KvPermissionsRepository::new(
        store.clone(),
        "gatehouse",
        Arc::new(ResourceFactoryRegistry::with_defaults()),
        Duration::from_secs(10),
        Duration::from_secs(1),
    );
    (repo, store)
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let (repo, _store) = repo_with_store();

    let mut alice = user_with_roles("alice", &["group1"]);
    alice.applications.insert(application(
        "deployer",
        &[(Authorization::Execute, &["group1"])],
    ));
    repo.put(&alice).await.unwrap();

    let stored = repo.get("alice").await.unwrap().unwrap();
    assert_eq!(stored.accounts, alice.accounts);
    assert_eq!(stored.applications, alice.applications);
    assert_eq!(stored.roles, alice.roles);
}

#[tokio::test]
async fn test_ids_are_lowercased() {
    let (repo, store) = repo_with_store();
    repo.put(&user_with_roles("Alice", &["group1"])).await.unwrap();

    assert!(store.sismember("gatehouse:users", "alice").await.unwrap());
    assert!(repo.get("ALICE").await.unwrap().is_some());
}

#[tokio::test]
async fn test_get_missing_user_is_none() {
    let (repo, _store) = repo_with_store();
    assert!(repo.get("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_role_sets_follow_membership_delta() {
    let (repo, store) = repo_with_store();

    repo.put(&user_with_roles("alice", &["old_role"])).await.unwrap();
    assert!(store
        .sismember("gatehouse:roles:old_role", "alice")
        .await
        .unwrap());

    repo.put(&user_with_roles("alice", &["new_role"])).await.unwrap();
    assert!(!store
        .sismember("gatehouse:roles:old_role", "alice")
        .await
        .unwrap());
    assert!(store
        .sismember("gatehouse:roles:new_role", "alice")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_admin_set_membership() {
    let (repo, store) = repo_with_store();

    let mut root = user_with_roles("root", &["admins"]);
    root.admin = true;
    repo.put(&root).await.unwrap();
    assert!(store
        .sismember("gatehouse:permissions:admin", "root")
        .await
        .unwrap());
    assert!(repo.get("root").await.unwrap().unwrap().admin);

    root.admin = false;
    repo.put(&root).await.unwrap();
    assert!(!store
        .sismember("gatehouse:permissions:admin", "root")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unrestricted_last_modified_written_and_merged() {
    let (repo, store) = repo_with_store();

    repo.put(&unrestricted_with_account("shared")).await.unwrap();
    let last_modified = store
        .get(&format!("gatehouse:last_modified:{UNRESTRICTED_USERNAME}"))
        .await
        .unwrap();
    assert!(last_modified.is_some());

    repo.put(&user_with_roles("alice", &["group1"])).await.unwrap();
    let alice = repo.get("alice").await.unwrap().unwrap();
    assert!(alice.accounts.iter().any(|a| a.name == "shared"));
}

#[tokio::test]
async fn test_get_all_by_roles_null_empty_and_matching() {
    let (repo, _store) = repo_with_store();

    repo.put(&unrestricted_with_account("shared")).await.unwrap();
    for (id, role) in [("u1", "role1"), ("u2", "role2"), ("u3", "role3")] {
        repo.put(&user_with_roles(id, &[role])).await.unwrap();
    }

    let all = repo.get_all_by_roles(None).await.unwrap();
    assert_eq!(all.len(), 4);

    let only_unrestricted = repo.get_all_by_roles(Some(&[])).await.unwrap();
    assert_eq!(only_unrestricted.len(), 1);
    assert!(only_unrestricted.contains_key(UNRESTRICTED_USERNAME));

    let filtered = repo
        .get_all_by_roles(Some(&["role2".to_string()]))
        .await
        .unwrap();
    let mut ids: Vec<&str> = filtered.keys().map(String::as_str).collect();
    ids.sort();
    assert_eq!(ids, vec![UNRESTRICTED_USERNAME, "u2"]);
}

#[tokio::test]
async fn test_put_all_prunes_orphans() {
    let (repo, store) = repo_with_store();

    repo.put(&unrestricted_with_account("shared")).await.unwrap();
    repo.put(&user_with_roles("alice", &["group1"])).await.unwrap();

    repo.put_all(HashMap::from([(
        "bob".to_string(),
        user_with_roles("bob", &["group2"]),
    )]))
    .await
    .unwrap();

    assert!(repo.get("alice").await.unwrap().is_none());
    assert!(!store.sismember("gatehouse:users", "alice").await.unwrap());
    assert!(!store
        .sismember("gatehouse:roles:group1", "alice")
        .await
        .unwrap());
    assert!(repo.get("bob").await.unwrap().is_some());
    assert!(repo.get(UNRESTRICTED_USERNAME).await.unwrap().is_some());
}

#[tokio::test]
async fn test_remove_clears_every_key() {
    let (repo, store) = repo_with_store();

    let mut root = user_with_roles("root", &["admins"]);
    root.admin = true;
    repo.put(&root).await.unwrap();

    repo.remove("root").await.unwrap();
    assert!(repo.get("root").await.unwrap().is_none());
    assert!(!store.sismember("gatehouse:users", "root").await.unwrap());
    assert!(!store
        .sismember("gatehouse:roles:admins", "root")
        .await
        .unwrap());
    assert!(!store
        .sismember("gatehouse:permissions:admin", "root")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_empty_resource_hashes_are_deleted() {
    let (repo, store) = repo_with_store();

    let mut alice = UserPermission::new("alice");
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["g1"])]));
    repo.put(&alice).await.unwrap();
    let (_, entries) = store
        .hscan("gatehouse:permissions:alice:accounts", 0)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    // Account disappears from the permission set
    repo.put(&UserPermission::new("alice")).await.unwrap();
    let (_, entries) = store
        .hscan("gatehouse:permissions:alice:accounts", 0)
        .await
        .unwrap();
    assert!(entries.is_empty());
}
