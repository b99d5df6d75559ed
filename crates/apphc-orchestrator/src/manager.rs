//! Application manager.
//!
//! Every public operation takes its lock first, keeps it for the whole
//! operation, and releases it on return through the guard, including on
//! error paths.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use apphc_backend::{BackendError, ClusterBackend, ImageRegistry, LimitRange, validate_image};
use apphc_catalog::{CatalogSynchronizer, ChartStore};
use apphc_core::config::PolicyConfig;
use apphc_core::lock::{self, LockGuard, LockRegistry};
use apphc_core::{
    AppFilter, AppInstanceData, AppRequest, AppsData, ControllerConfig, Cycle, DeleteMetadataRequest,
    DeleteRequest, EnableDisableRequest, InstanceState, NextAction, ResourceLimits, Response, annotations,
    naming,
};

use crate::chart_data::{self, ReusedChart};
use crate::engine::Engine;
use crate::error::{ApplyFailure, OrchestratorError, OrchestratorResult};
use crate::rollback::RollbackPlan;
use crate::summary::{AppSummary, AppsSummary, TemplateSummary};
use crate::{aggregator, post_deploy, storage, wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    Update,
    Upgrade,
}

impl UpdateMode {
    fn holder(self) -> &'static str {
        match self {
            UpdateMode::Update => "update_app",
            UpdateMode::Upgrade => "upgrade_app",
        }
    }

    fn nothing(self) -> &'static str {
        match self {
            UpdateMode::Update => "Nothing to update",
            UpdateMode::Upgrade => "Nothing to upgrade",
        }
    }

    fn commit(self) -> &'static str {
        match self {
            UpdateMode::Update => "Update application charts",
            UpdateMode::Upgrade => "Upgrade application charts",
        }
    }

    fn success(self) -> &'static str {
        match self {
            UpdateMode::Update => "Application updated successfully",
            UpdateMode::Upgrade => "Application upgraded successfully",
        }
    }

    fn reuses_values(self, req: &AppRequest) -> bool {
        match self {
            UpdateMode::Update => true,
            UpdateMode::Upgrade => req.reuse_values,
        }
    }
}

fn commit_message<'a>(description: &'a str, fallback: &'a str) -> &'a str {
    if description.is_empty() {
        fallback
    } else {
        description
    }
}

pub struct AppManager {
    backend: Arc<dyn ClusterBackend>,
    registry: Arc<dyn ImageRegistry>,
    catalog: Arc<CatalogSynchronizer>,
    store: ChartStore,
    engine: Engine,
    locks: LockRegistry,
    policy: PolicyConfig,
}

impl AppManager {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        registry: Arc<dyn ImageRegistry>,
        catalog: Arc<CatalogSynchronizer>,
        store: ChartStore,
        locks: LockRegistry,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            engine: Engine::new(backend.clone(), config.engine.clone()),
            backend,
            registry,
            catalog,
            store,
            locks,
            policy: config.policy.clone(),
        }
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ── Shared steps ────────────────────────────────────────────

    fn lock_app(&self, app_name: &str, root_group_id: Option<&str>, holder: &str) -> OrchestratorResult<LockGuard> {
        let key = lock::app_locker_key(app_name, root_group_id);
        self.locks
            .acquire(&key, holder)
            .ok_or_else(|| OrchestratorError::app_locked(app_name))
    }

    fn apps_catalog(&self) -> String {
        self.catalog.apps_catalog().to_string()
    }

    async fn sync_catalogs(&self) -> OrchestratorResult<()> {
        self.catalog.sync_cache().await?;
        self.catalog.refresh(self.catalog.apps_catalog()).await?;
        Ok(())
    }

    async fn check_image(&self, req: &AppRequest) -> OrchestratorResult<()> {
        if req.image.repo.is_empty() || req.image.tag.is_empty() {
            return Ok(());
        }
        match validate_image(self.registry.as_ref(), &req.image.repo, &req.image.tag).await {
            Ok(()) => Ok(()),
            Err(BackendError::InvalidImage(reason)) => Err(OrchestratorError::Validation(reason)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> OrchestratorResult<()> {
        info!(%namespace, "deleting namespace");
        let backend = self.backend.as_ref();
        backend.delete_namespace(namespace).await?;

        let config = self.engine.config();
        let budget = Duration::from_secs(config.namespace_timeout_secs);
        let tick = Duration::from_millis(config.delete_poll_ms);
        let gone = wait::poll_until(budget, tick, || async move {
            match backend.namespace_annotations(namespace).await {
                Ok(_) => Ok(None),
                Err(e) if e.is_not_found() => Ok(Some(())),
                Err(e) => Err(e),
            }
        })
        .await?;
        gone.ok_or_else(|| {
            OrchestratorError::DeadlineExceeded(format!("timed out waiting for namespace {namespace} deletion"))
        })
    }

    /// Fail when `instances` more containers at `limits` would not fit the
    /// cluster's unrequested capacity.
    async fn check_capacity(&self, limits: &ResourceLimits, instances: usize) -> OrchestratorResult<()> {
        if instances == 0 || limits.is_unbounded() {
            return Ok(());
        }
        let summary = self.backend.cluster_summary().await?;
        let count = instances as f64;
        let available_cpu = summary.cpu_total - summary.cpu_requested;
        if limits.cpu > 0.0 && limits.cpu * count > available_cpu {
            return Err(OrchestratorError::Validation(format!(
                "number of requested CPUs ({:.2}) exceeds number of available CPUs ({:.2})",
                limits.cpu * count,
                available_cpu
            )));
        }
        let free = u64::from(summary.memory_free_mib());
        let requested = u64::from(limits.memory) * instances as u64;
        if limits.memory > 0 && requested >= free {
            return Err(OrchestratorError::Validation(format!(
                "requested memory ({requested} MiB) exceeds available memory ({free} MiB)"
            )));
        }
        Ok(())
    }

    /// Bound the namespace's containers by `limits`, or lift every bound.
    async fn apply_limits(&self, namespace: &str, limits: Option<&ResourceLimits>) -> OrchestratorResult<()> {
        match limits.filter(|l| !l.is_unbounded()) {
            Some(limits) => {
                debug!(%namespace, cpu = limits.cpu, memory = limits.memory, "applying limit range");
                self.backend
                    .apply_limit_range(&LimitRange::new(namespace, limits))
                    .await?;
            }
            None => self.backend.delete_limit_range(namespace).await?,
        }
        Ok(())
    }

    // ── Create ──────────────────────────────────────────────────

    pub async fn create_app(&self, req: &AppRequest) -> OrchestratorResult<Response> {
        validate_create(req)?;
        let _guard = self.lock_app(&req.name, req.root_group(), "create_app")?;
        info!(app = %req.name, version = %req.version, groups = ?req.group_ids, "create application");

        self.check_image(req).await?;
        self.sync_catalogs().await?;

        let backend = self.backend.as_ref();
        let mut apps = aggregator::load_running(backend, &req.filter(), Some(&req.version)).await?;
        apps.new_instances = aggregator::build_desired(req);
        if apps.new_instances.is_empty() {
            return Err(OrchestratorError::NotFound("Nothing to deploy".into()));
        }

        let pending = aggregator::skip_running(&mut apps, &req.name);
        debug!(app = %req.name, pending, "instances to create");
        if pending == 0 {
            return Ok(Response::unchanged(format!("application {} already deployed", req.name)));
        }
        if let Some(limits) = &req.limits {
            self.check_capacity(limits, pending).await?;
        }

        let namespace = naming::target_namespace(&req.name);
        backend.ensure_namespace(&namespace).await?;
        if req.shared_storage > 0 {
            storage::ensure_shared_storage(backend, self.engine.config(), &req.name, &namespace, req.shared_storage)
                .await?;
        }
        self.apply_limits(&namespace, req.limits.as_ref()).await?;

        let catalog = self.apps_catalog();
        let mut charts = Vec::new();
        for data in apps
            .new_instances
            .iter_mut()
            .filter(|d| d.next_action != NextAction::None)
        {
            chart_data::merge_request(data, req, None)?;
            data.template_available = self
                .catalog
                .template_available(&catalog, data.template_name(), &data.requested_version)
                .await?;
            if !data.template_available {
                self.store.create_chart(data)?;
                charts.push(data.clone());
            }
        }
        if !charts.is_empty() {
            self.catalog
                .publish(&charts, commit_message(&req.description, "Create application charts"))
                .await?;
        }

        let done = self.engine.apply(apps.new_instances, &catalog).await?;
        if done.is_empty() {
            return Ok(Response::unchanged(format!("application {} already deployed", req.name)));
        }

        let message = if req.state.is_enabled() {
            "Application deployed successfully"
        } else {
            "Application deployed successfully, but disabled"
        };
        Ok(Response::success(message).with_body(&AppSummary::new(&req.name, &done)))
    }

    // ── Update / upgrade ────────────────────────────────────────

    /// Redeploy running instances, reusing the last deployed chart values.
    pub async fn update_app(&self, req: &AppRequest) -> OrchestratorResult<Response> {
        self.update_or_upgrade(req, UpdateMode::Update).await
    }

    /// Move instances to a new version, creating missing ones.
    pub async fn upgrade_app(&self, req: &AppRequest) -> OrchestratorResult<Response> {
        self.update_or_upgrade(req, UpdateMode::Upgrade).await
    }

    async fn update_or_upgrade(&self, req: &AppRequest, mode: UpdateMode) -> OrchestratorResult<Response> {
        if req.name.is_empty() {
            return Err(OrchestratorError::Validation("application name is required".into()));
        }
        validate_limits(req)?;
        let _guard = self.lock_app(&req.name, req.root_group(), mode.holder())?;
        info!(app = %req.name, version = %req.version, mode = mode.holder(), "update application");

        self.check_image(req).await?;
        let backend = self.backend.as_ref();
        let namespace = naming::target_namespace(&req.name);
        if mode == UpdateMode::Upgrade {
            backend.ensure_namespace(&namespace).await?;
        }
        self.sync_catalogs().await?;

        let mut apps = aggregator::load_running(backend, &req.filter(), Some(&req.version)).await?;
        apps.new_instances = aggregator::build_desired(req);
        if apps.new_instances.is_empty() && apps.running_for(&req.name).is_empty() {
            return Err(OrchestratorError::NotFound(mode.nothing().into()));
        }
        aggregator::reconcile(&mut apps, &req.name, self.policy.recreate);

        let limits = match req.limits {
            Some(limits) => Some(limits),
            None if mode.reuses_values(req) => backend
                .get_limit_range(&namespace)
                .await?
                .map(|range| range.limits()),
            None => None,
        };
        if let Some(limits) = &limits {
            let created = apps
                .new_instances
                .iter()
                .filter(|d| d.next_action == NextAction::Create)
                .count();
            self.check_capacity(limits, created).await?;
        }

        let reused = if mode.reuses_values(req) {
            self.reused_chart(&apps, &req.name)?
        } else {
            None
        };

        let mut plan = if self.policy.rollback {
            Some(RollbackPlan::new(&self.store, self.policy.recreate)?)
        } else {
            None
        };

        let AppsData {
            new_instances,
            running,
            ..
        } = &mut apps;
        let running = running.get(&req.name).map(Vec::as_slice).unwrap_or_default();
        for data in new_instances.iter_mut() {
            chart_data::merge_request(data, req, reused.as_ref())?;
            if let Some(plan) = plan.as_mut() {
                if let Some(current) = running.iter().find(|r| r.instance_name == data.instance_name) {
                    plan.record(current)?;
                }
            }
            self.store
                .delete_chart(data.app_name(), data.template_name(), Some(&data.requested_version))?;
            self.store.create_chart(data)?;
        }

        let instances = std::mem::take(new_instances);
        self.catalog
            .publish(&instances, commit_message(&req.description, mode.commit()))
            .await?;

        self.apply_limits(&namespace, limits.as_ref()).await?;
        if req.shared_storage > 0 {
            storage::ensure_shared_storage(backend, self.engine.config(), &req.name, &namespace, req.shared_storage)
                .await?;
        } else if !instances.iter().any(|d| d.shared_storage_enabled) {
            storage::delete_shared_storage(backend, self.engine.config(), &req.name, &namespace).await?;
        }

        let catalog = self.apps_catalog();
        match self.engine.apply(instances, &catalog).await {
            Ok(done) => Ok(Response::success(mode.success()).with_body(&AppSummary::new(&req.name, &done))),
            Err(failure) => self.roll_back(failure, plan, &catalog).await,
        }
    }

    /// Last deployed chart of the first running instance, or of the sample
    /// instance when no requested group runs yet.
    fn reused_chart(&self, apps: &AppsData, app_name: &str) -> OrchestratorResult<Option<ReusedChart>> {
        let Some(source) = apps
            .running_for(app_name)
            .first()
            .or(apps.sample_instance.as_ref())
        else {
            debug!(app = %app_name, "no deployed chart to reuse");
            return Ok(None);
        };
        let mut reused = ReusedChart::load(&self.store, app_name, source.template_name(), &source.current_version)?;
        if let Some(state) = source.annotations.get(annotations::STATE) {
            reused = reused.with_state(state);
        }
        Ok(Some(reused))
    }

    async fn roll_back(
        &self,
        failure: ApplyFailure,
        plan: Option<RollbackPlan>,
        catalog: &str,
    ) -> OrchestratorResult<Response> {
        let Some(plan) = plan.filter(|p| !p.is_empty() && failure.is_rollback_eligible()) else {
            return Err(OrchestratorError::Apply(failure));
        };
        warn!(failed = ?failure.failed_instances(), error = %failure, "update failed, rolling back");

        match self.restore(&plan, catalog).await {
            Ok(restored) => {
                info!(instances = restored.len(), "rollback complete");
                Err(OrchestratorError::RolledBack { failure, restored })
            }
            Err(e) => Err(OrchestratorError::RollbackFailed {
                failure,
                rollback: Box::new(e),
            }),
        }
    }

    async fn restore(&self, plan: &RollbackPlan, catalog: &str) -> OrchestratorResult<Vec<AppInstanceData>> {
        plan.restore_charts()?;
        self.catalog
            .publish(plan.backups(), "Restore application charts")
            .await?;
        Ok(self.engine.apply(plan.backups().to_vec(), catalog).await?)
    }

    // ── Delete ──────────────────────────────────────────────────

    pub async fn delete_app(&self, req: &DeleteRequest) -> OrchestratorResult<Response> {
        if req.name.is_empty() {
            return Err(OrchestratorError::Validation("application name is required".into()));
        }
        let root = req.root_group_id.as_deref().filter(|r| !r.is_empty());
        let _guard = self.lock_app(&req.name, root, "delete_app")?;
        info!(app = %req.name, groups = ?req.group_ids, purge = req.purge, "delete application");

        self.sync_catalogs().await?;
        let apps = aggregator::load_for_delete(self.backend.as_ref(), &req.filter()).await?;
        let instances = apps.running_for(&req.name).to_vec();
        if instances.is_empty() {
            return Err(OrchestratorError::NotFound("Nothing to delete".into()));
        }

        let purge = req.purge || self.policy.purge_metadata;
        let deleted = self.delete_instances(&req.name, instances, purge).await?;
        if purge {
            self.catalog.push("Delete application charts").await?;
            self.catalog.refresh(self.catalog.apps_catalog()).await?;
        }
        Ok(Response::success("Application instances successfully deleted")
            .with_body(&AppSummary::new(&req.name, &deleted)))
    }

    /// Delete every application instance in the cluster.
    pub async fn delete_apps(&self, req: &DeleteRequest) -> OrchestratorResult<Response> {
        let _guard = self
            .locks
            .acquire(lock::DELETE_APPS, "delete_apps")
            .ok_or_else(OrchestratorError::all_locked)?;
        info!(purge = req.purge, "delete all applications");

        self.sync_catalogs().await?;
        let apps = aggregator::load_for_delete(self.backend.as_ref(), &req.filter()).await?;
        if apps.running_count() == 0 {
            return Err(OrchestratorError::NotFound("Nothing to delete".into()));
        }

        let purge = req.purge || self.policy.purge_metadata;
        let mut names: Vec<&String> = apps.running.keys().collect();
        names.sort();
        let mut deleted = Vec::new();
        for name in names {
            let instances = apps.running_for(name).to_vec();
            deleted.extend(self.delete_instances(name, instances, purge).await?);
        }
        if purge {
            self.catalog.push("Delete application charts").await?;
            self.catalog.refresh(self.catalog.apps_catalog()).await?;
        }
        Ok(Response::success("Applications successfully deleted").with_body(&AppsSummary::from_instances(&deleted)))
    }

    /// Delete instances of one application, then its shared storage and
    /// namespace once no instance of it is left.
    async fn delete_instances(
        &self,
        app_name: &str,
        instances: Vec<AppInstanceData>,
        purge: bool,
    ) -> OrchestratorResult<Vec<AppInstanceData>> {
        let Some(namespace) = instances.first().map(|d| d.target_namespace.clone()) else {
            return Ok(Vec::new());
        };
        let deleted = match self.engine.delete(instances).await {
            Ok(deleted) => deleted,
            Err(failure) => {
                if purge {
                    warn!(
                        app = %app_name,
                        failed = ?failure.failed_instances(),
                        "delete partially failed, purging charts of deleted instances"
                    );
                    self.purge_charts(app_name, &failure.succeeded)?;
                }
                return Err(OrchestratorError::Apply(failure));
            }
        };
        if purge {
            self.purge_charts(app_name, &deleted)?;
        }

        let backend = self.backend.as_ref();
        let remaining = aggregator::load_running(backend, &AppFilter::by_name(app_name), None).await?;
        if remaining.running_for(app_name).is_empty() {
            storage::delete_shared_storage(backend, self.engine.config(), app_name, &namespace).await?;
            self.delete_namespace(&namespace).await?;
        } else {
            debug!(app = %app_name, remaining = remaining.running_count(), "instances remain, keeping namespace");
        }
        Ok(deleted)
    }

    fn purge_charts(&self, app_name: &str, deleted: &[AppInstanceData]) -> OrchestratorResult<()> {
        for data in deleted {
            let version = Some(data.requested_version.as_str()).filter(|v| !v.is_empty());
            self.store
                .delete_chart(app_name, data.template_name(), version)?;
        }
        self.store.prune_app_dir(app_name)?;
        Ok(())
    }

    /// Remove chart metadata (template versions) of an application.
    pub async fn delete_app_metadata(&self, req: &DeleteMetadataRequest) -> OrchestratorResult<Response> {
        if req.name.is_empty() {
            return Err(OrchestratorError::Validation("application name is required".into()));
        }
        let _guard = self
            .locks
            .acquire(&lock::app_locker_key(&req.name, None), "delete_app_metadata")
            .ok_or_else(|| OrchestratorError::metadata_locked(&req.name))?;
        info!(app = %req.name, version = ?req.version, "delete application metadata");

        self.catalog.sync_cache().await?;
        let root = req.root_group_id.as_deref().filter(|r| !r.is_empty());
        let templates = if req.group_ids.is_empty() {
            self.store.templates(&req.name)?
        } else {
            req.group_ids
                .iter()
                .filter(|g| !g.is_empty())
                .map(|gid| naming::instance_name(&req.name, root, gid))
                .collect()
        };

        let version = req.version.as_deref().filter(|v| !v.is_empty());
        let catalog = self.apps_catalog();
        let mut removed = Vec::new();
        for template in templates {
            let mut versions = self.store.chart_versions(&req.name, &template)?;
            if let Some(version) = version {
                versions.retain(|v| v == version);
            }
            if versions.is_empty() {
                debug!(
                    %template,
                    version = version.unwrap_or("any"),
                    "no metadata found for the instance"
                );
                continue;
            }
            self.store.delete_chart(&req.name, &template, version)?;
            removed.push(TemplateSummary {
                name: template,
                catalog: catalog.clone(),
                versions,
            });
        }
        if removed.is_empty() {
            return Err(OrchestratorError::NotFound("Nothing to delete".into()));
        }

        self.store.prune_app_dir(&req.name)?;
        self.catalog.push("Delete application metadata").await?;
        self.catalog.refresh(&catalog).await?;
        Ok(Response::success("Application metadata successfully deleted").with_body(&removed))
    }

    // ── Enable / disable ────────────────────────────────────────

    /// Switch matching instances between enabled and disabled.
    ///
    /// Disabling removes the workload and keeps the application object.
    /// Enabling an instance whose workload is gone redeploys it at its
    /// recorded version; run-once instances are only re-annotated.
    pub async fn enable_disable_app(&self, req: &EnableDisableRequest) -> OrchestratorResult<Response> {
        let _guard = self
            .locks
            .acquire(lock::ENABLE_DISABLE_APPS, "enable_disable_app")
            .ok_or_else(|| {
                if req.name.is_empty() {
                    OrchestratorError::all_locked()
                } else {
                    OrchestratorError::app_locked(&req.name)
                }
            })?;
        let target = req.target_state();
        info!(app = %req.name, state = target.as_str(), "enable/disable application");

        let backend = self.backend.as_ref();
        let apps = aggregator::load_running(backend, &req.filter(), None).await?;
        if apps.running_count() == 0 {
            return Err(OrchestratorError::NotFound("no application found".into()));
        }

        let mut names: Vec<&String> = apps.running.keys().collect();
        names.sort();
        let mut touched = Vec::new();
        let mut redeploy = Vec::new();
        for name in names {
            for running in apps.running_for(name) {
                let mut data = running.clone();
                let (namespace, instance) = (data.target_namespace.clone(), data.instance_name.clone());
                data.state = target;
                data.annotations
                    .insert(annotations::STATE.into(), target.as_str().into());
                backend
                    .update_app_metadata(&namespace, &instance, &data.annotations, &data.labels)
                    .await?;

                match target {
                    InstanceState::Disabled => post_deploy::disable(backend, &namespace, &instance).await?,
                    InstanceState::Enabled => {
                        let missing = backend.get_workload(&namespace, &instance).await?.is_none();
                        if missing && data.cycle() != Some(Cycle::RunOnce) {
                            let mut again = data.clone();
                            again.requested_version = again
                                .version_annotation()
                                .unwrap_or(&again.current_version)
                                .to_string();
                            again.next_action = NextAction::Recreate;
                            again.delete_instance_storage = false;
                            redeploy.push(again);
                        }
                    }
                }
                touched.push(data);
            }
        }

        if !redeploy.is_empty() {
            self.engine.apply(redeploy, &self.apps_catalog()).await?;
        }
        let message = match target {
            InstanceState::Enabled => "Application(s) enabled successfully",
            InstanceState::Disabled => "Application(s) disabled successfully",
        };
        Ok(Response::success(message).with_body(&AppsSummary::from_instances(&touched)))
    }

    // ── Listing ─────────────────────────────────────────────────

    pub async fn get_apps(&self, filter: &AppFilter) -> OrchestratorResult<Response> {
        let apps = aggregator::load_running(self.backend.as_ref(), filter, None).await?;
        if apps.running_count() == 0 {
            return Err(OrchestratorError::NotFound("no application found".into()));
        }
        let instances: Vec<AppInstanceData> = apps.running.into_values().flatten().collect();
        Ok(Response::success("Running applications").with_body(&AppsSummary::from_instances(&instances)))
    }
}

fn validate_create(req: &AppRequest) -> OrchestratorResult<()> {
    let invalid = |reason: &str| Err(OrchestratorError::Validation(reason.to_string()));
    if req.name.is_empty() {
        return invalid("application name is required");
    }
    if req.version.is_empty() {
        return invalid("application version is required");
    }
    if !req.group_ids.iter().any(|g| !g.is_empty()) {
        return invalid("at least one group id is required");
    }
    if req.image.repo.is_empty() || req.image.tag.is_empty() {
        return invalid("image repository and tag are required");
    }
    if req.cycle == Cycle::Periodic && req.schedule.as_deref().is_none_or(str::is_empty) {
        return invalid("periodic application requires a schedule");
    }
    validate_limits(req)
}

fn validate_limits(req: &AppRequest) -> OrchestratorResult<()> {
    match &req.limits {
        Some(limits) => limits.validate().map_err(OrchestratorError::Validation),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphc_backend::MemoryBackend;
    use apphc_catalog::LocalRepo;
    use apphc_core::ResponseStatus;
    use apphc_core::config::EngineConfig;
    use std::path::Path;

    struct Harness {
        backend: MemoryBackend,
        apps_repo: Arc<LocalRepo>,
        manager: AppManager,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_policy(PolicyConfig::default())
        }

        fn with_policy(policy: PolicyConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = dir.path().to_path_buf();
            let backend = MemoryBackend::new().with_catalog_root("apps", cache.join("apps"));
            let apps_repo = Arc::new(LocalRepo::new("apps", cache.join("apps")));
            let shared: Arc<dyn ClusterBackend> = Arc::new(backend.clone());
            let catalog = CatalogSynchronizer::new(
                Arc::new(LocalRepo::new("templates", cache.join("templates"))),
                apps_repo.clone(),
                shared.clone(),
            )
            .with_visibility(3, Duration::from_millis(10));

            let config = ControllerConfig {
                policy,
                engine: EngineConfig {
                    launch_stagger_ms: 10,
                    create_timeout_secs: 2,
                    create_poll_ms: 50,
                    delete_timeout_secs: 2,
                    delete_poll_ms: 50,
                    volume_timeout_secs: 2,
                    volume_poll_ms: 50,
                    namespace_timeout_secs: 2,
                    readiness_creating_secs: 2,
                    readiness_error_secs: 1,
                    readiness_poll_ms: 50,
                },
                ..Default::default()
            };
            let manager = AppManager::new(
                shared,
                Arc::new(backend.clone()),
                Arc::new(catalog),
                ChartStore::new(&cache, "templates", "apps"),
                LockRegistry::new(),
                &config,
            );
            Self {
                backend,
                apps_repo,
                manager,
                dir,
            }
        }

        fn cache(&self) -> &Path {
            self.dir.path()
        }

        fn ops(&self, prefix: &str) -> usize {
            self.backend
                .operations()
                .iter()
                .filter(|op| op.starts_with(prefix))
                .count()
        }
    }

    fn request(groups: &[&str], version: &str) -> AppRequest {
        AppRequest::new("foo", version)
            .with_groups(groups)
            .with_image("registry.local/foo", version)
    }

    #[tokio::test]
    async fn create_deploys_new_instance() {
        let h = Harness::new();
        let response = h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();

        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.message, "Application deployed successfully");
        let app = h.backend.find_app("foo-g1").unwrap();
        assert_eq!(app.namespace, "foo");
        assert_eq!(app.annotations[annotations::VERSION], "1.0.0");
        assert!(h.cache().join("apps/foo/foo-g1/1.0.0/values.yaml").is_file());
        assert_eq!(h.apps_repo.pushes(), vec!["Create application charts"]);
        // No limits requested.
        assert!(h.backend.limit_range("foo").is_none());
        assert!(h.manager.locks().held_keys().is_empty());

        let body = response.body.unwrap();
        assert_eq!(body["instances"][0]["name"], "foo-g1");
    }

    #[tokio::test]
    async fn second_create_is_unchanged() {
        let h = Harness::new();
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();
        let response = h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Unchanged);
        assert_eq!(response.message, "application foo already deployed");
        assert_eq!(h.ops("create_app"), 1);
    }

    #[tokio::test]
    async fn unchanged_create_touches_nothing() {
        let h = Harness::new();
        let req = request(&["g1"], "1.0.0").with_limits(0.5, 256);
        h.manager.create_app(&req).await.unwrap();
        let range = h.backend.limit_range("foo").unwrap();
        assert_eq!(range.max_cpu, Some(0.5));
        assert_eq!(range.max_memory_mib, Some(256));
        let before = h.backend.operations().len();

        let response = h.manager.create_app(&req).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Unchanged);
        assert_eq!(h.backend.operations().len(), before);
        assert_eq!(h.ops("apply_limit_range"), 1);
    }

    #[tokio::test]
    async fn limits_must_fit_the_cluster() {
        let h = Harness::new();
        let err = h
            .manager
            .create_app(&request(&["g1", "g2"], "1.0.0").with_limits(3.0, 0))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "number of requested CPUs (6.00) exceeds number of available CPUs (4.00)"
        );

        let err = h
            .manager
            .create_app(&request(&["g1"], "1.0.0").with_limits(0.0, 8192))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "requested memory (8192 MiB) exceeds available memory (8192 MiB)"
        );

        let err = h
            .manager
            .create_app(&request(&["g1"], "1.0.0").with_limits(0.05, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(!h.backend.has_namespace("foo"));
    }

    #[tokio::test]
    async fn update_keeps_limits_and_plain_upgrade_lifts_them() {
        let h = Harness::new();
        h.manager
            .create_app(&request(&["g1"], "1.0.0").with_limits(1.0, 128))
            .await
            .unwrap();

        h.manager
            .update_app(&AppRequest::new("foo", "1.0.0").with_groups(&["g1"]))
            .await
            .unwrap();
        assert_eq!(h.backend.limit_range("foo").unwrap().max_cpu, Some(1.0));

        h.manager
            .upgrade_app(&request(&["g1"], "2.0.0").with_limits(2.0, 0))
            .await
            .unwrap();
        let range = h.backend.limit_range("foo").unwrap();
        assert_eq!(range.max_cpu, Some(2.0));
        assert_eq!(range.max_memory_mib, None);

        h.manager.upgrade_app(&request(&["g1"], "3.0.0")).await.unwrap();
        assert!(h.backend.limit_range("foo").is_none());
        assert_eq!(h.ops("delete_limit_range"), 1);
    }

    #[tokio::test]
    async fn disabled_create_mentions_state() {
        let h = Harness::new();
        let mut req = request(&["g1"], "1.0.0");
        req.state = InstanceState::Disabled;
        let response = h.manager.create_app(&req).await.unwrap();
        assert_eq!(response.message, "Application deployed successfully, but disabled");
        assert!(!h.backend.has_workload("foo", "foo-g1"));
    }

    #[tokio::test]
    async fn create_rejects_incomplete_requests() {
        let h = Harness::new();
        let err = h
            .manager
            .create_app(&AppRequest::new("foo", "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        let err = h
            .manager
            .create_app(&request(&["g1"], "1.0.0").with_image("Not A Repo", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(h.backend.operations().is_empty());
    }

    #[tokio::test]
    async fn locked_app_is_refused() {
        let h = Harness::new();
        let _held = h.manager.locks().acquire("foo", "someone").unwrap();
        let err = h
            .manager
            .create_app(&request(&["g1"], "1.0.0"))
            .await
            .unwrap_err();
        assert!(err.is_locked());
        assert_eq!(err.to_string(), "application foo is locked");
        assert!(h.backend.operations().is_empty());
    }

    #[tokio::test]
    async fn global_action_blocks_app_operations() {
        let h = Harness::new();
        let _held = h
            .manager
            .locks()
            .acquire(lock::UPGRADE_CLUSTER, "upgrade")
            .unwrap();
        let err = h
            .manager
            .delete_app(&DeleteRequest {
                name: "foo".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_locked());
    }

    #[tokio::test]
    async fn upgrade_moves_to_new_version() {
        let h = Harness::new();
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();

        let response = h.manager.upgrade_app(&request(&["g1"], "2.0.0")).await.unwrap();
        assert_eq!(response.message, "Application upgraded successfully");
        let app = h.backend.find_app("foo-g1").unwrap();
        assert!(app.external_id.contains("version=2.0.0"));
        assert_eq!(h.ops("upgrade_app"), 1);
        assert_eq!(h.ops("create_app"), 1);
    }

    #[tokio::test]
    async fn update_with_same_version_recreates() {
        let h = Harness::new();
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();

        let mut req = AppRequest::new("foo", "1.0.0").with_groups(&["g1"]);
        req.env_vars.insert("LEVEL".into(), "debug".into());
        let response = h.manager.update_app(&req).await.unwrap();
        assert_eq!(response.message, "Application updated successfully");
        assert_eq!(h.ops("delete_app"), 1);
        assert_eq!(h.ops("create_app"), 2);

        let values = std::fs::read_to_string(h.cache().join("apps/foo/foo-g1/1.0.0/values.yaml")).unwrap();
        assert!(values.contains("LEVEL: debug"));
        // Reused from the first deployment.
        assert!(values.contains("registry.local/foo"));
    }

    #[tokio::test]
    async fn failed_recreate_is_rolled_back_once() {
        let h = Harness::new();
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();
        h.backend.fail_creates("foo-g1", 1);

        let err = h
            .manager
            .update_app(&AppRequest::new("foo", "1.0.0").with_groups(&["g1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RolledBack { .. }));
        let response = err.into_response();
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(
            response.message,
            "upgrade failed, the application was rolled back to previous state"
        );

        let app = h.backend.find_app("foo-g1").unwrap();
        assert!(app.external_id.contains("version=1.0.0"));
        assert_eq!(
            h.apps_repo.pushes(),
            vec![
                "Create application charts",
                "Update application charts",
                "Restore application charts"
            ]
        );
        assert!(h.manager.locks().held_keys().is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_is_reported() {
        let h = Harness::new();
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();
        h.backend.fail_creates("foo-g1", 2);

        let err = h
            .manager
            .update_app(&AppRequest::new("foo", "1.0.0").with_groups(&["g1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RollbackFailed { .. }));
        assert!(err.to_string().starts_with("upgrade and rollback failed: "));
        // The restore ran exactly once.
        let restores = h
            .apps_repo
            .pushes()
            .iter()
            .filter(|p| *p == "Restore application charts")
            .count();
        assert_eq!(restores, 1);
    }

    #[tokio::test]
    async fn rollback_disabled_by_policy() {
        let h = Harness::with_policy(PolicyConfig {
            rollback: false,
            ..Default::default()
        });
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();
        h.backend.fail_creates("foo-g1", 1);

        let err = h
            .manager
            .update_app(&AppRequest::new("foo", "1.0.0").with_groups(&["g1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Apply(_)));
        assert!(h.backend.find_app("foo-g1").is_none());
    }

    #[tokio::test]
    async fn nothing_to_update() {
        let h = Harness::new();
        let err = h
            .manager
            .update_app(&AppRequest::new("foo", "1.0.0"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Nothing to update");
        assert_eq!(err.into_response().status, ResponseStatus::NotFound);
    }

    #[tokio::test]
    async fn delete_all_keeps_metadata_without_purge() {
        let h = Harness::new();
        h.manager
            .create_app(&request(&["g1", "g2", "g3"], "1.0.0"))
            .await
            .unwrap();

        let response = h
            .manager
            .delete_apps(&DeleteRequest::default())
            .await
            .unwrap();
        assert_eq!(response.message, "Applications successfully deleted");
        assert_eq!(h.ops("delete_app "), 3);
        assert!(!h.backend.has_namespace("foo"));
        assert!(h.cache().join("apps/foo/foo-g1/1.0.0").is_dir());
        assert!(h.manager.locks().held_keys().is_empty());
    }

    #[tokio::test]
    async fn partial_delete_keeps_namespace() {
        let h = Harness::new();
        h.manager
            .create_app(&request(&["g1", "g2", "g3"], "1.0.0"))
            .await
            .unwrap();
        h.backend.fail_deletes("foo-g2", 1);

        let err = h
            .manager
            .delete_app(&DeleteRequest {
                name: "foo".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Apply(ref f) if f.errors.len() == 1));
        assert_eq!(h.ops("delete_app "), 2);
        assert!(h.backend.has_namespace("foo"));
    }

    #[tokio::test]
    async fn partial_delete_purges_deleted_charts() {
        let h = Harness::new();
        h.manager
            .create_app(&request(&["g1", "g2"], "1.0.0"))
            .await
            .unwrap();
        h.backend.fail_deletes("foo-g2", 1);

        let err = h
            .manager
            .delete_app(&DeleteRequest {
                name: "foo".into(),
                purge: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Apply(ref f) if f.succeeded.len() == 1));
        assert!(!h.cache().join("apps/foo/foo-g1").exists());
        assert!(h.cache().join("apps/foo/foo-g2/1.0.0").is_dir());
        assert!(h.backend.find_app("foo-g2").is_some());
    }

    #[tokio::test]
    async fn delete_with_purge_removes_charts() {
        let h = Harness::new();
        h.manager
            .create_app(&request(&["g1", "g2"], "1.0.0"))
            .await
            .unwrap();

        let response = h
            .manager
            .delete_app(&DeleteRequest {
                name: "foo".into(),
                group_ids: vec!["g1".into()],
                purge: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.message, "Application instances successfully deleted");
        assert!(!h.cache().join("apps/foo/foo-g1").exists());
        assert!(h.cache().join("apps/foo/foo-g2/1.0.0").is_dir());
        // foo-g2 still runs.
        assert!(h.backend.has_namespace("foo"));
        assert!(h.apps_repo.pushes().contains(&"Delete application charts".to_string()));
    }

    #[tokio::test]
    async fn nothing_to_delete() {
        let h = Harness::new();
        let err = h
            .manager
            .delete_app(&DeleteRequest {
                name: "foo".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(ref m) if m == "Nothing to delete"));
    }

    #[tokio::test]
    async fn metadata_delete_removes_versions() {
        let h = Harness::new();
        h.manager.create_app(&request(&["g1"], "1.0.0")).await.unwrap();
        h.manager.upgrade_app(&request(&["g1"], "2.0.0")).await.unwrap();

        let response = h
            .manager
            .delete_app_metadata(&DeleteMetadataRequest {
                name: "foo".into(),
                version: Some("1.0.0".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.message, "Application metadata successfully deleted");
        assert!(!h.cache().join("apps/foo/foo-g1/1.0.0").exists());
        assert!(h.cache().join("apps/foo/foo-g1/2.0.0").is_dir());

        let err = h
            .manager
            .delete_app_metadata(&DeleteMetadataRequest {
                name: "foo".into(),
                version: Some("1.0.0".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn disable_then_enable() {
        let h = Harness::new();
        h.manager
            .create_app(&request(&["g1", "g2"], "1.0.0"))
            .await
            .unwrap();

        let response = h
            .manager
            .enable_disable_app(&EnableDisableRequest {
                name: "foo".into(),
                enable: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.message, "Application(s) disabled successfully");
        assert!(!h.backend.has_workload("foo", "foo-g1"));
        assert_eq!(
            h.backend.find_app("foo-g1").unwrap().annotations[annotations::STATE],
            "disabled"
        );

        let response = h
            .manager
            .enable_disable_app(&EnableDisableRequest {
                name: "foo".into(),
                enable: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.message, "Application(s) enabled successfully");
        assert!(h.backend.has_workload("foo", "foo-g1"));
        assert!(h.backend.has_workload("foo", "foo-g2"));
        assert_eq!(
            h.backend.find_app("foo-g2").unwrap().annotations[annotations::STATE],
            "enabled"
        );
    }

    #[tokio::test]
    async fn get_apps_lists_running() {
        let h = Harness::new();
        let err = h.manager.get_apps(&AppFilter::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "no application found");

        h.manager
            .create_app(&request(&["g1", "g2"], "1.0.0"))
            .await
            .unwrap();
        let response = h.manager.get_apps(&AppFilter::by_name("foo")).await.unwrap();
        assert_eq!(response.message, "Running applications");
        let summary: AppsSummary = serde_json::from_value(response.body.unwrap()).unwrap();
        assert_eq!(summary.instance_count(), 2);
    }
}
