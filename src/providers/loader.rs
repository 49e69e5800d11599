use super::breaker::CircuitBreaker;
use super::health::HealthTracker;
use super::ProviderError;
use crate::model::{Resource, ResourceFactoryRegistry, ResourceType};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("inventory parse error: {0}")]
    Parse(String),

    #[error("circuit open")]
    CircuitOpen,

    #[error("{0}")]
    Source(String),
}

impl LoadError {
    /// Parse failures are permanent; retrying the same payload cannot help.
    fn is_transient(&self) -> bool {
        matches!(self, LoadError::Io(_) | LoadError::Source(_))
    }
}

/// One call against a system-of-record, returning its full resource list.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    fn name(&self) -> &str;

    fn resource_type(&self) -> ResourceType;

    async fn load(&self) -> Result<Vec<Resource>, LoadError>;
}

/// Reads a JSON inventory file from disk. This is the reference
/// system-of-record client used by development deployments and tests; the
/// production registry clients implement the same trait elsewhere.
pub struct FileResourceLoader {
    name: String,
    resource_type: ResourceType,
    path: PathBuf,
    registry: Arc<ResourceFactoryRegistry>,
}

impl FileResourceLoader {
    pub fn new(
        name: &str,
        resource_type: ResourceType,
        path: PathBuf,
        registry: Arc<ResourceFactoryRegistry>,
    ) -> Self {
        FileResourceLoader {
            name: name.to_string(),
            resource_type,
            path,
            registry,
        }
    }
}

#[async_trait]
impl ResourceLoader for FileResourceLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_type(&self) -> ResourceType {
        self.resource_type.clone()
    }

    async fn load(&self) -> Result<Vec<Resource>, LoadError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(&content).map_err(|e| LoadError::Parse(e.to_string()))?;

        let mut resources = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let resource = self
                .registry
                .parse(&self.resource_type, &name, &entry.to_string())
                .map_err(|e| LoadError::Parse(e.to_string()))?;
            resources.push(resource);
        }
        Ok(resources)
    }
}

/// The immutable resource list observed at the last successful load.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub resources: Vec<Resource>,
}

/// Background cache around a loader: a periodic task refreshes the
/// snapshot; readers always observe the last good one. Calls out are
/// guarded by a circuit breaker and bounded retries.
pub struct CachedLoader {
    source: Arc<dyn ResourceLoader>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    generation: AtomicU64,
    health: Arc<HealthTracker>,
    breaker: CircuitBreaker,
    refresh_interval: Duration,
}

impl CachedLoader {
    pub fn new(
        source: Arc<dyn ResourceLoader>,
        max_staleness: Duration,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        let health = Arc::new(HealthTracker::new(source.name(), max_staleness));
        Arc::new(CachedLoader {
            source,
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
            health,
            breaker: CircuitBreaker::default(),
            refresh_interval,
        })
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn resource_type(&self) -> ResourceType {
        self.source.resource_type()
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    /// Invoke the source once, with retries, and swap the snapshot on
    /// success. On failure the previous snapshot stays in place and the
    /// health timestamp does not advance.
    pub async fn refresh(&self) {
        match self.load_guarded().await {
            Ok(resources) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let count = resources.len();
                *self.snapshot.write().unwrap() = Some(Arc::new(Snapshot {
                    generation,
                    resources,
                }));
                self.health.record_success();
                debug!(
                    loader = self.source.name(),
                    generation, count, "refreshed resource snapshot"
                );
            }
            Err(err) => {
                let has_snapshot = self.snapshot.read().unwrap().is_some();
                if has_snapshot {
                    warn!(
                        loader = self.source.name(),
                        error = %err,
                        "resource load failed; serving previous snapshot"
                    );
                } else {
                    warn!(
                        loader = self.source.name(),
                        error = %err,
                        "resource load failed and no snapshot exists yet"
                    );
                }
            }
        }
    }

    async fn load_guarded(&self) -> Result<Vec<Resource>, LoadError> {
        if !self.breaker.allow() {
            return Err(LoadError::CircuitOpen);
        }

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_secs(15)),
            ..ExponentialBackoff::default()
        };

        let result = backoff::future::retry(policy, || async {
            self.source.load().await.map_err(|err| {
                if err.is_transient() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        })
        .await;

        match result {
            Ok(resources) => {
                self.breaker.record_success();
                Ok(resources)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    /// The current snapshot, or `NoSnapshot` if no load ever succeeded.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>, ProviderError> {
        self.snapshot
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ProviderError::NoSnapshot(self.source.name().to_string()))
    }

    /// Spawn the periodic refresh task.
    pub fn spawn_refresh(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.refresh().await;
            }
        })
    }
}
