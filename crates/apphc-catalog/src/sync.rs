//! Catalog synchronizer.
//!
//! Drives each catalog through `Idle → Syncing → Refreshing →
//! WaitingForVisibility → Idle | Failed`. Visibility polling is a blocking
//! loop with a fixed attempt count; there is no notification channel from
//! the backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use apphc_backend::ClusterBackend;
use apphc_core::AppInstanceData;

use crate::error::{CatalogError, CatalogResult};
use crate::repo::CatalogRepo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Refreshing,
    WaitingForVisibility,
    Failed,
}

pub struct CatalogSynchronizer {
    templates: Arc<dyn CatalogRepo>,
    apps: Arc<dyn CatalogRepo>,
    backend: Arc<dyn ClusterBackend>,
    attempts: u32,
    interval: Duration,
    phases: Mutex<HashMap<String, SyncPhase>>,
}

impl CatalogSynchronizer {
    pub fn new(
        templates: Arc<dyn CatalogRepo>,
        apps: Arc<dyn CatalogRepo>,
        backend: Arc<dyn ClusterBackend>,
    ) -> Self {
        Self {
            templates,
            apps,
            backend,
            attempts: 20,
            interval: Duration::from_secs(1),
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// Override the visibility polling bounds.
    pub fn with_visibility(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts;
        self.interval = interval;
        self
    }

    pub fn templates_catalog(&self) -> &str {
        self.templates.name()
    }

    pub fn apps_catalog(&self) -> &str {
        self.apps.name()
    }

    pub fn phase(&self, catalog: &str) -> SyncPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(catalog)
            .copied()
            .unwrap_or_default()
    }

    fn set_phase(&self, catalog: &str, phase: SyncPhase) {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(catalog.to_string(), phase);
    }

    /// Record the outcome of a step, moving to `Failed` on error.
    fn track<T>(&self, catalog: &str, result: CatalogResult<T>, done: SyncPhase) -> CatalogResult<T> {
        self.set_phase(catalog, if result.is_ok() { done } else { SyncPhase::Failed });
        result
    }

    /// Pull both catalog repositories concurrently; the first failure aborts.
    pub async fn sync_cache(&self) -> CatalogResult<()> {
        let (templates, apps) = (self.templates.name(), self.apps.name());
        self.set_phase(templates, SyncPhase::Syncing);
        self.set_phase(apps, SyncPhase::Syncing);

        let result = tokio::try_join!(self.templates.pull(), self.apps.pull());
        let phase = if result.is_ok() {
            SyncPhase::Idle
        } else {
            SyncPhase::Failed
        };
        self.set_phase(templates, phase);
        self.set_phase(apps, phase);
        result?;
        debug!(%templates, %apps, "catalog cache synchronized");
        Ok(())
    }

    /// Commit and push the application catalog.
    pub async fn push(&self, description: &str) -> CatalogResult<()> {
        let result = self.apps.push(description).await;
        self.track(self.apps.name(), result, SyncPhase::Idle)
    }

    /// Ask the backend to re-index a catalog.
    pub async fn refresh(&self, catalog: &str) -> CatalogResult<()> {
        self.set_phase(catalog, SyncPhase::Refreshing);
        let result = self.backend.refresh_catalog(catalog).await.map_err(CatalogError::from);
        self.track(catalog, result, SyncPhase::Idle)
    }

    /// Whether the backend has indexed `template` at `version`.
    pub async fn template_available(&self, catalog: &str, template: &str, version: &str) -> CatalogResult<bool> {
        let versions = self.backend.template_versions(catalog, template).await?;
        Ok(versions.iter().any(|tv| tv.version == version))
    }

    /// Poll until every instance's template version is indexed in `catalog`.
    ///
    /// Instances found are dropped from the pending set. Fails with
    /// [`CatalogError::VisibilityTimeout`] once the attempts are exhausted.
    pub async fn wait_for_visibility(&self, instances: &[AppInstanceData], catalog: &str) -> CatalogResult<()> {
        info!(%catalog, instances = instances.len(), "waiting for catalog visibility");
        self.set_phase(catalog, SyncPhase::WaitingForVisibility);

        let mut pending: BTreeMap<String, (String, String)> = instances
            .iter()
            .map(|inst| {
                let version = inst
                    .version_annotation()
                    .unwrap_or(&inst.requested_version)
                    .to_string();
                (
                    inst.instance_name.clone(),
                    (inst.template_name().to_string(), version),
                )
            })
            .collect();

        for attempt in 1..=self.attempts {
            let mut found = Vec::new();
            for (name, (template, version)) in &pending {
                let available = self.template_available(catalog, template, version).await;
                if self.track(catalog, available, SyncPhase::WaitingForVisibility)? {
                    found.push(name.clone());
                }
            }
            for name in found {
                pending.remove(&name);
            }
            if pending.is_empty() {
                debug!(%catalog, attempt, "catalog entries visible");
                self.set_phase(catalog, SyncPhase::Idle);
                return Ok(());
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        let pending: Vec<String> = pending.into_keys().collect();
        warn!(%catalog, ?pending, "catalog entries not visible");
        self.set_phase(catalog, SyncPhase::Failed);
        Err(CatalogError::VisibilityTimeout { pending })
    }

    /// Push the application catalog, re-index it, and wait for the instances.
    pub async fn publish(&self, instances: &[AppInstanceData], description: &str) -> CatalogResult<()> {
        let catalog = self.apps.name().to_string();
        self.push(description).await?;
        self.refresh(&catalog).await?;
        self.wait_for_visibility(instances, &catalog).await
    }
}
