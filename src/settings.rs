use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub database: Database,
    pub kv: Kv,
    pub auth: Auth,
    pub unrestricted: Unrestricted,
    pub providers: Providers,
    pub write_mode: WriteMode,
    pub repository: Repository,
    pub web: Web,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// SeaORM/SQLx connection string, e.g., sqlite://gatehouse.db?mode=rwc
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kv {
    /// Key prefix for the remote key-value backend
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Any membership in one of these roles marks the user as admin
    pub admin_roles: Vec<String>,
    /// Skip restriction filtering for applications; the view layer decides
    pub allow_access_to_unknown_applications: bool,
    /// Authorization that seeds an empty EXECUTE group set (READ or WRITE)
    pub execute_fallback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Unrestricted {
    /// Roles granted to the anonymous/unrestricted user
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Providers {
    /// Interval between resource inventory refreshes
    pub refresh_interval_secs: u64,
    /// A loader is unhealthy once its last success is older than this
    pub max_staleness_secs: u64,
    /// TTL of the post-processed resource set cache
    pub cache_ttl_secs: u64,
    /// Directory holding the JSON inventory files
    pub inventory_dir: PathBuf,
    /// JSON file mapping user ids to group names
    pub roles_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMode {
    /// Master switch for the user roles syncer
    pub enabled: bool,
    /// Interval between successful sync ticks; negative disables scheduling
    pub sync_delay_ms: i64,
    /// Interval before retrying after a failed tick
    pub sync_failure_delay_ms: i64,
    /// Wall-clock budget for retries inside one tick
    pub sync_delay_timeout_ms: i64,
    /// Fixed backoff between in-tick retries
    pub retry_interval_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// One of: inMemory | relational | remoteKv | dual
    pub kind: String,
    /// TTL of the unrestricted-permission cache
    pub cache_ttl_secs: u64,
    /// Per-call deadline for key-value reads
    pub read_timeout_ms: u64,
    pub dual: Dual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dual {
    pub primary: String,
    pub previous: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Web {
    /// Expose GET /authorize (the full fleet dump)
    pub get_all_enabled: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7003,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://gatehouse.db?mode=rwc".to_string(),
        }
    }
}

impl Default for Kv {
    fn default() -> Self {
        Self {
            prefix: "gatehouse".to_string(),
        }
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            admin_roles: Vec::new(),
            allow_access_to_unknown_applications: false,
            execute_fallback: "READ".to_string(),
        }
    }
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            max_staleness_secs: 90,
            cache_ttl_secs: 10,
            inventory_dir: PathBuf::from("data/inventory"),
            roles_file: PathBuf::from("data/roles.json"),
        }
    }
}

impl Default for WriteMode {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_delay_ms: 600_000,
            sync_failure_delay_ms: 600_000,
            sync_delay_timeout_ms: 30_000,
            retry_interval_ms: 10_000,
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self {
            kind: "relational".to_string(),
            cache_ttl_secs: 10,
            read_timeout_ms: 1_000,
            dual: Dual::default(),
        }
    }
}

impl Default for Dual {
    fn default() -> Self {
        Self {
            primary: "relational".to_string(),
            previous: "inMemory".to_string(),
        }
    }
}

impl Default for Web {
    fn default() -> Self {
        Self {
            get_all_enabled: false,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("server.host", defaults.server.host)
            .into_diagnostic()?
            .set_default("server.port", defaults.server.port as i64)
            .into_diagnostic()?
            .set_default("database.url", defaults.database.url)
            .into_diagnostic()?
            .set_default("kv.prefix", defaults.kv.prefix)
            .into_diagnostic()?
            .set_default("auth.admin_roles", defaults.auth.admin_roles)
            .into_diagnostic()?
            .set_default(
                "auth.allow_access_to_unknown_applications",
                defaults.auth.allow_access_to_unknown_applications,
            )
            .into_diagnostic()?
            .set_default("auth.execute_fallback", defaults.auth.execute_fallback)
            .into_diagnostic()?
            .set_default("unrestricted.roles", defaults.unrestricted.roles)
            .into_diagnostic()?
            .set_default(
                "providers.refresh_interval_secs",
                defaults.providers.refresh_interval_secs as i64,
            )
            .into_diagnostic()?
            .set_default(
                "providers.max_staleness_secs",
                defaults.providers.max_staleness_secs as i64,
            )
            .into_diagnostic()?
            .set_default(
                "providers.cache_ttl_secs",
                defaults.providers.cache_ttl_secs as i64,
            )
            .into_diagnostic()?
            .set_default(
                "providers.inventory_dir",
                defaults.providers.inventory_dir.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default(
                "providers.roles_file",
                defaults.providers.roles_file.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default("write_mode.enabled", defaults.write_mode.enabled)
            .into_diagnostic()?
            .set_default("write_mode.sync_delay_ms", defaults.write_mode.sync_delay_ms)
            .into_diagnostic()?
            .set_default(
                "write_mode.sync_failure_delay_ms",
                defaults.write_mode.sync_failure_delay_ms,
            )
            .into_diagnostic()?
            .set_default(
                "write_mode.sync_delay_timeout_ms",
                defaults.write_mode.sync_delay_timeout_ms,
            )
            .into_diagnostic()?
            .set_default(
                "write_mode.retry_interval_ms",
                defaults.write_mode.retry_interval_ms,
            )
            .into_diagnostic()?
            .set_default("repository.kind", defaults.repository.kind)
            .into_diagnostic()?
            .set_default(
                "repository.cache_ttl_secs",
                defaults.repository.cache_ttl_secs as i64,
            )
            .into_diagnostic()?
            .set_default(
                "repository.read_timeout_ms",
                defaults.repository.read_timeout_ms as i64,
            )
            .into_diagnostic()?
            .set_default("repository.dual.primary", defaults.repository.dual.primary)
            .into_diagnostic()?
            .set_default(
                "repository.dual.previous",
                defaults.repository.dual.previous,
            )
            .into_diagnostic()?
            .set_default("web.get_all_enabled", defaults.web.get_all_enabled)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: GATEHOUSE__SERVER__PORT=7004, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("GATEHOUSE").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let s: Settings = cfg.try_deserialize().into_diagnostic()?;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.providers.refresh_interval_secs, 30);
        assert_eq!(s.providers.cache_ttl_secs, 10);
        assert_eq!(s.repository.kind, "relational");
        assert_eq!(s.auth.execute_fallback, "READ");
        assert!(s.write_mode.enabled);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let s = Settings::load("does-not-exist.toml").expect("load should fall back to defaults");
        assert_eq!(s.server.port, Settings::default().server.port);
        assert_eq!(s.write_mode.sync_delay_ms, 600_000);
    }
}
