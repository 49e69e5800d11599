use clap::Parser;
use gatehouse::model::{Authorization, ResourceFactoryRegistry, ResourceType};
use gatehouse::permissions::PermissionsResolver;
use gatehouse::providers::application::ApplicationProvider;
use gatehouse::providers::base::BaseProvider;
use gatehouse::providers::health::HealthRegistry;
use gatehouse::providers::loader::{CachedLoader, FileResourceLoader, ResourceLoader};
use gatehouse::providers::ResourceProvider;
use gatehouse::roles::FileRolesProvider;
use gatehouse::sync::lock::SyncLock;
use gatehouse::sync::UserRolesSyncer;
use gatehouse::{repository, settings, sync, web};
use miette::{IntoDiagnostic, Result};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about = "Authorization service")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run one full permission sync and exit
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = sea_orm::Database::connect(&settings.database.url)
        .await
        .into_diagnostic()?;

    // run migrations
    migration::Migrator::up(&db, None).await.into_diagnostic()?;
    tracing::info!("Database migrations applied successfully");

    let registry = Arc::new(ResourceFactoryRegistry::with_defaults());

    // resource loaders, one per inventory file
    let refresh = Duration::from_secs(settings.providers.refresh_interval_secs);
    let staleness = Duration::from_secs(settings.providers.max_staleness_secs);
    let cache_ttl = Duration::from_secs(settings.providers.cache_ttl_secs);
    let inventory_dir = settings.providers.inventory_dir.clone();

    let make_loader = |file: &str, name: &str, resource_type: ResourceType| -> Arc<CachedLoader> {
        let source: Arc<dyn ResourceLoader> = Arc::new(FileResourceLoader::new(
            name,
            resource_type,
            inventory_dir.join(file),
            registry.clone(),
        ));
        CachedLoader::new(source, staleness, refresh)
    };
    let accounts_loader = make_loader("accounts.json", "accounts", ResourceType::account());
    let applications_loader = make_loader(
        "applications.json",
        "applications",
        ResourceType::application(),
    );
    let catalog_loader = make_loader(
        "applications_catalog.json",
        "applications-catalog",
        ResourceType::application(),
    );
    let build_services_loader = make_loader(
        "build_services.json",
        "build-services",
        ResourceType::build_service(),
    );
    let service_accounts_loader = make_loader(
        "service_accounts.json",
        "service-accounts",
        ResourceType::service_account(),
    );
    let loaders: Vec<Arc<CachedLoader>> = vec![
        accounts_loader.clone(),
        applications_loader.clone(),
        catalog_loader.clone(),
        build_services_loader.clone(),
        service_accounts_loader.clone(),
    ];

    let mut health = HealthRegistry::new();
    for loader in &loaders {
        health.register(loader.health());
    }
    let health = Arc::new(health);

    // first load, then the periodic refresh tasks
    for loader in &loaders {
        loader.refresh().await;
        loader.clone().spawn_refresh();
    }

    // resource providers
    let execute_fallback = Authorization::parse(&settings.auth.execute_fallback)
        .ok_or_else(|| {
            miette::miette!(
                "auth.execute_fallback must be READ or WRITE, got `{}`",
                settings.auth.execute_fallback
            )
        })?;
    let accounts_provider: Arc<dyn ResourceProvider> =
        Arc::new(BaseProvider::new(accounts_loader, cache_ttl));
    let applications_provider: Arc<dyn ResourceProvider> = Arc::new(ApplicationProvider::new(
        applications_loader,
        Some(catalog_loader),
        execute_fallback,
        settings.auth.allow_access_to_unknown_applications,
        cache_ttl,
    ));
    let build_services_provider: Arc<dyn ResourceProvider> =
        Arc::new(BaseProvider::new(build_services_loader, cache_ttl));
    let service_accounts_provider: Arc<dyn ResourceProvider> =
        Arc::new(BaseProvider::new(service_accounts_loader, cache_ttl));
    let providers: Vec<Arc<dyn ResourceProvider>> = vec![
        accounts_provider,
        applications_provider,
        build_services_provider,
        service_accounts_provider.clone(),
    ];

    // resolver and repository
    let roles_provider = Arc::new(FileRolesProvider::new(settings.providers.roles_file.clone()));
    let resolver = Arc::new(
        PermissionsResolver::new(
            roles_provider,
            providers,
            &settings.auth.admin_roles,
            &settings.unrestricted.roles,
        )
        .with_allow_unknown_applications(settings.auth.allow_access_to_unknown_applications),
    );
    let repo = repository::build_repository(&settings, db.clone(), registry.clone())?;

    let syncer = Arc::new(UserRolesSyncer::new(
        SyncLock::new(db.clone()),
        repo.clone(),
        resolver.clone(),
        service_accounts_provider,
        health.clone(),
        settings.write_mode.clone(),
    ));

    match cli.command {
        Some(Command::Sync) => {
            let count = syncer.sync_and_count().await?;
            tracing::info!(count, "One-shot permission sync completed");
            Ok(())
        }
        None => {
            // the periodic syncer is a write-mode concern; readers-only
            // deployments never schedule it
            let _scheduler = if settings.write_mode.enabled {
                Some(sync::init_scheduler(syncer).await?)
            } else {
                tracing::info!("Write mode disabled; user role syncer is suppressed");
                None
            };

            let state = web::AppState {
                repository: repo,
                resolver,
                health,
                get_all_enabled: settings.web.get_all_enabled,
            };
            web::serve(&settings, state).await
        }
    }
}
