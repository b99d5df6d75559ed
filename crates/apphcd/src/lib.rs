//! apphcd — assembly of the controller's services.
//!
//! The cluster backend is always the in-process [`MemoryBackend`]. Outside
//! standalone mode the catalogs are git working copies, images are checked
//! against the configured registry and cluster upgrades run over ssh.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use apphc_api::ApiState;
use apphc_backend::{ClusterBackend, HttpRegistry, ImageRegistry, MemoryBackend};
use apphc_catalog::{CatalogRepo, CatalogSynchronizer, ChartStore, GitRepo, LocalRepo};
use apphc_core::{ControllerConfig, LockRegistry};
use apphc_orchestrator::AppManager;
use apphc_cluster::{ClusterManager, RemoteShell, ScriptedShell, SshShell, UpgradeCoordinator};

/// Default `RUST_LOG` filter.
pub const DEFAULT_LOG_FILTER: &str = "info,apphcd=debug,apphc=debug";

pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct Collaborators {
    templates: Arc<dyn CatalogRepo>,
    apps: Arc<dyn CatalogRepo>,
    registry: Arc<dyn ImageRegistry>,
    shell: Arc<dyn RemoteShell>,
}

async fn git_collaborators(config: &ControllerConfig) -> anyhow::Result<Collaborators> {
    let catalog = &config.catalog;
    let open = |name: &str| -> anyhow::Result<GitRepo> {
        Ok(GitRepo::new(
            name,
            catalog.cache_dir.join(name),
            &catalog.url,
            &catalog.user,
            &catalog.password,
            &catalog.branch,
        )?)
    };
    let templates = open(&catalog.templates_catalog)?;
    let apps = open(&catalog.apps_catalog)?;
    templates.open().await?;
    apps.open().await?;

    let cluster = &config.cluster;
    Ok(Collaborators {
        templates: Arc::new(templates),
        apps: Arc::new(apps),
        registry: Arc::new(HttpRegistry::new(&cluster.registry)),
        shell: Arc::new(SshShell::from_config(cluster)),
    })
}

fn local_collaborators(config: &ControllerConfig, backend: &MemoryBackend) -> anyhow::Result<Collaborators> {
    let catalog = &config.catalog;
    let templates = LocalRepo::new(&catalog.templates_catalog, catalog.cache_dir.join(&catalog.templates_catalog));
    let apps = LocalRepo::new(&catalog.apps_catalog, catalog.cache_dir.join(&catalog.apps_catalog));
    std::fs::create_dir_all(templates.path())?;
    std::fs::create_dir_all(apps.path())?;
    Ok(Collaborators {
        templates: Arc::new(templates),
        apps: Arc::new(apps),
        registry: Arc::new(backend.clone()),
        // No upgrade bundle is ever staged in standalone mode.
        shell: Arc::new(ScriptedShell::new().reply("-o available", 1, "")),
    })
}

/// Build the API state for `config`.
pub async fn assemble(config: &ControllerConfig, standalone: bool) -> anyhow::Result<ApiState> {
    let catalog = &config.catalog;
    let backend = MemoryBackend::new().with_catalog_root(&catalog.apps_catalog, apps_root(config));
    let parts = if standalone {
        info!(cache = %catalog.cache_dir.display(), "standalone mode, local catalogs");
        local_collaborators(config, &backend)?
    } else {
        warn!("cluster backend is in-process; application state is not persisted");
        git_collaborators(config).await?
    };

    let cluster: Arc<dyn ClusterBackend> = Arc::new(backend);
    let locks = LockRegistry::new();
    let synchronizer = CatalogSynchronizer::new(parts.templates, parts.apps, cluster.clone())
        .with_visibility(catalog.visibility_attempts, catalog.visibility_interval());
    let store = ChartStore::new(&catalog.cache_dir, &catalog.templates_catalog, &catalog.apps_catalog);

    let manager = AppManager::new(
        cluster.clone(),
        parts.registry,
        Arc::new(synchronizer),
        store,
        locks.clone(),
        config,
    );
    let upgrade = UpgradeCoordinator::new(parts.shell, cluster.clone(), locks.clone(), config.cluster.clone());
    let admin = ClusterManager::new(cluster, locks, upgrade, config.cluster.clone());
    Ok(ApiState {
        manager: Arc::new(manager),
        cluster: Arc::new(admin),
    })
}

fn apps_root(config: &ControllerConfig) -> std::path::PathBuf {
    config.catalog.cache_dir.join(&config.catalog.apps_catalog)
}

/// Load the config file, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => {
            let config = ControllerConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(ControllerConfig::default()),
    }
}
