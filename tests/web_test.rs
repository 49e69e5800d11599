mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use gatehouse::model::{Authorization, ResourceFactoryRegistry, ResourceType};
use gatehouse::permissions::PermissionsResolver;
use gatehouse::providers::base::BaseProvider;
use gatehouse::providers::health::HealthRegistry;
use gatehouse::providers::loader::{CachedLoader, FileResourceLoader, ResourceLoader};
use gatehouse::providers::ResourceProvider;
use gatehouse::repository::memory::InMemoryPermissionsRepository;
use gatehouse::repository::PermissionsRepository;
use gatehouse::roles::FileRolesProvider;
use gatehouse::web::{router, AppState};
use helpers::builders::*;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const ACCOUNTS: &str = r#"[
    {"name": "prod", "permissions": {"READ": ["group1"], "WRITE": ["group2"]}},
    {"name": "open"}
]"#;

const ROLES: &str = r#"{"users": {"bob": ["group1"], "carol": []}}"#;

struct Fixture {
    _dir: tempfile::TempDir,
    state: AppState,
    repository: Arc<InMemoryPermissionsRepository>,
}

async fn fixture(refresh_loaders: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ResourceFactoryRegistry::with_defaults());

    let accounts_path = dir.path().join("accounts.json");
    std::fs::write(&accounts_path, ACCOUNTS).unwrap();
    let source: Arc<dyn ResourceLoader> = Arc::new(FileResourceLoader::new(
        "accounts",
        ResourceType::account(),
        accounts_path,
        registry.clone(),
    ));
    let loader = CachedLoader::new(source, Duration::from_secs(90), Duration::from_secs(30));
    if refresh_loaders {
        loader.refresh().await;
    }

    let mut health = HealthRegistry::new();
    health.register(loader.health());

    let provider: Arc<dyn ResourceProvider> =
        Arc::new(BaseProvider::new(loader, Duration::from_secs(10)));

    let roles_path = dir.path().join("roles.json");
    std::fs::write(&roles_path, ROLES).unwrap();
    let resolver = Arc::new(PermissionsResolver::new(
        Arc::new(FileRolesProvider::new(roles_path)),
        vec![provider],
        &[],
        &[],
    ));

    let repository = Arc::new(InMemoryPermissionsRepository::new());
    let state = AppState {
        repository: repository.clone(),
        resolver,
        health: Arc::new(health),
        get_all_enabled: false,
    };

    Fixture {
        _dir: dir,
        state,
        repository,
    }
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_get_view_404_then_200() {
    let fixture = fixture(true).await;

    let (status, _) = send(&fixture.state, get("/authorize/alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut alice = user_with_roles("alice", &["group1"]);
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["group1"])]));
    fixture.repository.put(&alice).await.unwrap();

    let (status, body) = send(&fixture.state, get("/authorize/alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "alice");
    assert_eq!(body["admin"], false);
    let accounts = body["accounts"].as_array().unwrap();
    assert_eq!(accounts.len(), 2);
}

#[tokio::test]
async fn test_filtered_views() {
    let fixture = fixture(true).await;
    let mut alice = user_with_roles("alice", &["group1"]);
    alice
        .accounts
        .insert(account("prod", &[(Authorization::Read, &["group1"])]));
    fixture.repository.put(&alice).await.unwrap();

    let (status, body) = send(&fixture.state, get("/authorize/alice/accounts")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().len() >= 1);

    let (status, body) = send(&fixture.state, get("/authorize/alice/accounts/prod")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "prod");
    assert!(body["authorizations"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("READ")));

    let (status, _) = send(&fixture.state, get("/authorize/alice/accounts/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&fixture.state, get("/authorize/alice/serviceAccounts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_post_roles_syncs_user() {
    let fixture = fixture(true).await;

    let request = Request::builder()
        .method("POST")
        .uri("/roles/bob")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&fixture.state, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&fixture.state, get("/authorize/bob")).await;
    assert_eq!(status, StatusCode::OK);
    let accounts = body["accounts"].as_array().unwrap();
    assert!(accounts.iter().any(|a| a["name"] == "prod"));
    assert_eq!(body["roles"], serde_json::json!(["group1"]));
}

#[tokio::test]
async fn test_put_roles_with_external_roles() {
    let fixture = fixture(true).await;

    let request = Request::builder()
        .method("PUT")
        .uri("/roles/carol")
        .header("content-type", "application/json")
        .body(Body::from(r#"["group2"]"#))
        .unwrap();
    let (status, _) = send(&fixture.state, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&fixture.state, get("/authorize/carol")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["roles"], serde_json::json!(["group2"]));
    let accounts = body["accounts"].as_array().unwrap();
    assert!(accounts.iter().any(|a| a["name"] == "prod"));
}

#[tokio::test]
async fn test_delete_roles_removes_user() {
    let fixture = fixture(true).await;
    fixture
        .repository
        .put(&user_with_roles("bob", &["group1"]))
        .await
        .unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri("/roles/bob")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&fixture.state, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&fixture.state, get("/authorize/bob")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_all_respects_flag() {
    let fixture = fixture(true).await;
    let (status, _) = send(&fixture.state, get("/authorize")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut enabled = fixture.state.clone();
    enabled.get_all_enabled = true;
    fixture
        .repository
        .put(&user_with_roles("alice", &["group1"]))
        .await
        .unwrap();
    let (status, body) = send(&enabled, get("/authorize")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_id_is_bad_request() {
    let fixture = fixture(true).await;
    let (status, _) = send(&fixture.state, get("/authorize/%20")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reflects_loader_state() {
    let stale = fixture(false).await;
    let (status, body) = send(&stale.state, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["healthy"], false);

    let fresh = fixture(true).await;
    let (status, body) = send(&fresh.state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["providers"]["accounts"]["healthy"], true);
}
