//! HTTP boundary. Handlers stay thin: they normalize ids, call into the
//! repository/resolver, and project records into views. Request
//! authentication and TLS live in front of this service.

use crate::model::{Role, RoleSource, UserPermissionView};
use crate::permissions::{PermissionsResolver, ResolutionError};
use crate::providers::health::HealthRegistry;
use crate::repository::{PermissionsRepository, RepositoryError};
use crate::roles::ExternalUser;
use crate::settings::Settings;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            WebError::NotFound => StatusCode::NOT_FOUND,
            WebError::Repository(RepositoryError::ReadTimeout { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn PermissionsRepository>,
    pub resolver: Arc<PermissionsResolver>,
    pub health: Arc<HealthRegistry>,
    pub get_all_enabled: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/authorize", get(get_all_views))
        .route("/authorize/{id}", get(get_view))
        .route("/authorize/{id}/accounts", get(get_accounts))
        .route("/authorize/{id}/accounts/{name}", get(get_account))
        .route("/authorize/{id}/applications", get(get_applications))
        .route("/authorize/{id}/applications/{name}", get(get_application))
        .route("/authorize/{id}/serviceAccounts", get(get_service_accounts))
        .route(
            "/authorize/{id}/serviceAccounts/{name}",
            get(get_service_account),
        )
        .route(
            "/roles/{id}",
            post(sync_user_roles)
                .put(sync_user_roles_with_external)
                .delete(delete_user),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: &Settings, state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| miette::miette!("failed to bind {addr}: {e}"))?;
    tracing::info!("authorization server listening on {addr}");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| miette::miette!("server error: {e}"))?;
    Ok(())
}

fn normalize_id(id: &str) -> Result<String, WebError> {
    let id = id.trim().to_lowercase();
    if id.is_empty() {
        return Err(WebError::InvalidArgument("user id must not be empty".into()));
    }
    Ok(id)
}

async fn fetch_view(state: &AppState, id: &str) -> Result<UserPermissionView, WebError> {
    let id = normalize_id(id)?;
    let permission = state
        .repository
        .get(&id)
        .await?
        .ok_or(WebError::NotFound)?;
    Ok(permission.to_view())
}

async fn health(State(state): State<AppState>) -> Response {
    let providers = state.health.snapshot();
    let healthy = state.health.all_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "healthy": healthy, "providers": providers }))).into_response()
}

async fn get_all_views(
    State(state): State<AppState>,
) -> Result<Json<Vec<UserPermissionView>>, WebError> {
    if !state.get_all_enabled {
        return Err(WebError::NotFound);
    }
    let all = state.repository.get_all_by_id().await?;
    let mut views: Vec<UserPermissionView> =
        all.values().map(|permission| permission.to_view()).collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(views))
}

async fn get_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserPermissionView>, WebError> {
    Ok(Json(fetch_view(&state, &id).await?))
}

async fn get_accounts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, WebError> {
    let view = fetch_view(&state, &id).await?;
    Ok(Json(json!(view.accounts)))
}

async fn get_account(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, WebError> {
    let view = fetch_view(&state, &id).await?;
    let account = view
        .accounts
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(&name))
        .ok_or(WebError::NotFound)?;
    Ok(Json(json!(account)))
}

async fn get_applications(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, WebError> {
    let view = fetch_view(&state, &id).await?;
    Ok(Json(json!(view.applications)))
}

async fn get_application(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, WebError> {
    let view = fetch_view(&state, &id).await?;
    let application = view
        .applications
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(&name))
        .ok_or(WebError::NotFound)?;
    Ok(Json(json!(application)))
}

async fn get_service_accounts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, WebError> {
    let view = fetch_view(&state, &id).await?;
    Ok(Json(json!(view.service_accounts)))
}

async fn get_service_account(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, WebError> {
    let view = fetch_view(&state, &id).await?;
    let account = view
        .service_accounts
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(&name))
        .ok_or(WebError::NotFound)?;
    Ok(Json(json!(account)))
}

/// Resolve one user with no external roles and persist the result.
async fn sync_user_roles(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, WebError> {
    let id = normalize_id(&id)?;
    let permission = state.resolver.resolve(&id).await?;
    state.repository.put(&permission).await?;
    Ok(StatusCode::OK)
}

/// Resolve one user with caller-supplied external roles and persist.
async fn sync_user_roles_with_external(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(external_roles): Json<Vec<String>>,
) -> Result<StatusCode, WebError> {
    let id = normalize_id(&id)?;
    let user = ExternalUser::new(&id).with_external_roles(
        external_roles
            .iter()
            .map(|name| Role::with_source(name, RoleSource::External)),
    );
    let permission = state.resolver.resolve_and_merge(&user).await?;
    state.repository.put(&permission).await?;
    Ok(StatusCode::OK)
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, WebError> {
    let id = normalize_id(&id)?;
    state.repository.remove(&id).await?;
    Ok(StatusCode::OK)
}
