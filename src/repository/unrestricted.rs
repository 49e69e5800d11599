use super::RepositoryError;
use crate::model::UserPermission;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Loads that observe a missing or zero `updated_at` use this key; their
/// results are served but never become the fallback.
pub const SENTINEL_KEY: &str = "0";

/// Single-entry cache for the unrestricted record, keyed by its
/// `updated_at`. A key change forces a backend reload; the short TTL
/// bounds staleness. The last successfully loaded entry doubles as a
/// fallback so a dead backend degrades to stale reads instead of errors.
pub struct UnrestrictedCache {
    cache: moka::future::Cache<String, Arc<UserPermission>>,
    fallback: RwLock<Option<(String, Arc<UserPermission>)>>,
}

impl UnrestrictedCache {
    pub fn new(ttl: Duration) -> Self {
        UnrestrictedCache {
            cache: moka::future::Cache::builder()
                .time_to_live(ttl)
                .max_capacity(4)
                .build(),
            fallback: RwLock::new(None),
        }
    }

    /// Fetch the entry for `key`, loading through `load` on a miss. On
    /// load failure the fallback entry is served with a warning; the error
    /// surfaces only when no fallback exists yet.
    pub async fn get<F, Fut>(
        &self,
        key: String,
        load: F,
    ) -> Result<Arc<UserPermission>, RepositoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UserPermission, RepositoryError>>,
    {
        let loaded = self
            .cache
            .try_get_with(key.clone(), async move { load().await.map(Arc::new) })
            .await;

        match loaded {
            Ok(permission) => {
                if key != SENTINEL_KEY {
                    *self.fallback.write().unwrap() = Some((key, permission.clone()));
                }
                Ok(permission)
            }
            Err(err) => {
                let fallback = self.fallback.read().unwrap().clone();
                match fallback {
                    Some((fallback_key, permission)) => {
                        warn!(
                            error = %err,
                            key = %fallback_key,
                            "unrestricted permission load failed; serving fallback entry"
                        );
                        Ok(permission)
                    }
                    None => Err(RepositoryError::Backend(format!(
                        "failed to load unrestricted permission for key `{key}`: {err}"
                    ))),
                }
            }
        }
    }

    pub fn fallback_key(&self) -> Option<String> {
        self.fallback
            .read()
            .unwrap()
            .as_ref()
            .map(|(key, _)| key.clone())
    }

    /// Drop every cached entry but keep the fallback pointer.
    pub fn invalidate(&self) {
        debug!("invalidating unrestricted permission cache");
        self.cache.invalidate_all();
    }
}
