pub mod dual;
pub mod kv;
pub mod memory;
pub mod sql;
pub mod unrestricted;

use crate::model::{ResourceFactoryRegistry, UserPermission};
use crate::settings::Settings;
use async_trait::async_trait;
use miette::Diagnostic;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub use crate::model::UNRESTRICTED_USERNAME;

#[derive(Debug, Error, Diagnostic)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    #[diagnostic(code(gatehouse::repository::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("serialization error: {0}")]
    #[diagnostic(code(gatehouse::repository::serde))]
    Serde(#[from] serde_json::Error),

    #[error("key-value backend error: {0}")]
    #[diagnostic(code(gatehouse::repository::kv))]
    Kv(String),

    #[error("read timed out after {timeout:?} in {operation}")]
    #[diagnostic(code(gatehouse::repository::read_timeout))]
    ReadTimeout {
        operation: String,
        timeout: Duration,
    },

    #[error("failed to parse stored resource body: {0}")]
    #[diagnostic(code(gatehouse::repository::body))]
    Body(String),

    #[error("{0}")]
    #[diagnostic(code(gatehouse::repository::backend))]
    Backend(String),
}

/// Stores and retrieves per-user permission records. Gets and puts are
/// asymmetrical by design: every read merges the current unrestricted
/// record into the response.
#[async_trait]
pub trait PermissionsRepository: Send + Sync {
    /// Idempotent upsert of one record.
    async fn put(&self, permission: &UserPermission) -> Result<(), RepositoryError>;

    /// Bulk upsert with orphan pruning: stored users absent from the input
    /// are removed (the unrestricted record excepted), and resources no
    /// surviving user references are garbage-collected.
    async fn put_all(
        &self,
        permissions: HashMap<String, UserPermission>,
    ) -> Result<(), RepositoryError>;

    /// For a non-unrestricted id, the stored record merged with the
    /// current unrestricted record; for the unrestricted id, the record
    /// itself, cache-fronted.
    async fn get(&self, id: &str) -> Result<Option<UserPermission>, RepositoryError>;

    async fn get_all_by_id(&self) -> Result<HashMap<String, UserPermission>, RepositoryError>;

    /// `None` means all users; `Some([])` only the unrestricted record;
    /// otherwise users whose roles intersect, plus the unrestricted
    /// record.
    async fn get_all_by_roles(
        &self,
        any_roles: Option<&[String]>,
    ) -> Result<HashMap<String, UserPermission>, RepositoryError>;

    /// Delete the user and their permission rows; shared resources stay.
    async fn remove(&self, id: &str) -> Result<(), RepositoryError>;
}

/// A deadline every read helper checks at its entry point. Work past the
/// deadline stops with a typed timeout instead of piling onto a slow
/// backend.
#[derive(Debug, Clone)]
pub struct TimeoutContext {
    operation: String,
    timeout: Duration,
    expires_at: Instant,
}

impl TimeoutContext {
    pub fn new(operation: &str, timeout: Duration) -> Self {
        TimeoutContext {
            operation: operation.to_string(),
            timeout,
            expires_at: Instant::now() + timeout,
        }
    }

    pub fn check(&self) -> Result<(), RepositoryError> {
        if Instant::now() > self.expires_at {
            Err(RepositoryError::ReadTimeout {
                operation: self.operation.clone(),
                timeout: self.timeout,
            })
        } else {
            Ok(())
        }
    }
}

/// Build the repository stack selected by configuration.
pub fn build_repository(
    settings: &Settings,
    db: sea_orm::DatabaseConnection,
    registry: Arc<ResourceFactoryRegistry>,
) -> Result<Arc<dyn PermissionsRepository>, crate::errors::GateError> {
    let cache_ttl = Duration::from_secs(settings.repository.cache_ttl_secs);
    let read_timeout = Duration::from_millis(settings.repository.read_timeout_ms);

    let build_single = |kind: &str| -> Result<Arc<dyn PermissionsRepository>, crate::errors::GateError> {
        match kind {
            "inMemory" => Ok(Arc::new(memory::InMemoryPermissionsRepository::new())),
            "relational" => Ok(Arc::new(sql::SqlPermissionsRepository::new(
                db.clone(),
                registry.clone(),
                cache_ttl,
            ))),
            "remoteKv" => Ok(Arc::new(kv::KvPermissionsRepository::new(
                Arc::new(kv::InMemoryKvStore::new()),
                &settings.kv.prefix,
                registry.clone(),
                cache_ttl,
                read_timeout,
            ))),
            other => Err(crate::errors::GateError::BadConfig(format!(
                "unknown repository kind `{other}`"
            ))),
        }
    };

    match settings.repository.kind.as_str() {
        "dual" => {
            let primary_kind = settings.repository.dual.primary.as_str();
            let previous_kind = settings.repository.dual.previous.as_str();
            if primary_kind == previous_kind {
                return Err(crate::errors::GateError::BadConfig(format!(
                    "dual repository requires two distinct backends, got `{primary_kind}` twice"
                )));
            }
            let primary = build_single(primary_kind)?;
            let previous = build_single(previous_kind)?;
            Ok(Arc::new(dual::DualPermissionsRepository::new(
                primary, previous,
            )))
        }
        kind => build_single(kind),
    }
}
