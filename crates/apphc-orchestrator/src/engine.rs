//! Orchestration engine.
//!
//! Executes each instance's [`NextAction`] against the cluster backend.
//! Instances run concurrently, with a fixed stagger between launches, and
//! the engine waits for all of them before reporting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use apphc_backend::{AppSpec, ClusterBackend, ExternalId};
use apphc_core::config::EngineConfig;
use apphc_core::{AppInstanceData, NextAction, annotations};

use crate::error::{ApplyError, ApplyFailure};
use crate::storage::{self, VolumeTarget};
use crate::{post_deploy, wait};

#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn ClusterBackend>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(backend: Arc<dyn ClusterBackend>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every instance's next action; instances with `None` are skipped.
    ///
    /// Returns the instances acted upon, sorted by name. If any instance
    /// fails, every failure is reported together with the successes.
    pub async fn apply(
        &self,
        instances: Vec<AppInstanceData>,
        catalog: &str,
    ) -> Result<Vec<AppInstanceData>, ApplyFailure> {
        let stagger = Duration::from_millis(self.config.launch_stagger_ms);
        let mut tasks = JoinSet::new();
        let mut names: HashMap<Id, String> = HashMap::new();
        let mut launched = 0usize;

        for data in instances
            .into_iter()
            .filter(|d| d.next_action != NextAction::None)
        {
            if launched > 0 {
                sleep(stagger).await;
            }
            launched += 1;
            debug!(instance = %data.instance_name, action = %data.next_action, "launching");
            let engine = self.clone();
            let catalog = catalog.to_string();
            let name = data.instance_name.clone();
            let handle = tasks.spawn(async move {
                let result = engine.run(&data, &catalog).await;
                (data, result)
            });
            names.insert(handle.id(), name);
        }

        let mut succeeded = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((data, Ok(()))) => succeeded.push(data),
                Ok((data, Err(e))) => {
                    warn!(instance = %data.instance_name, action = %data.next_action, error = %e, "instance failed");
                    errors.push(e);
                }
                Err(e) => errors.push(task_failure(&names, e)),
            }
        }
        succeeded.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));

        if errors.is_empty() {
            info!(instances = succeeded.len(), "apply complete");
            Ok(succeeded)
        } else {
            errors.sort_by(|a, b| a.instance.cmp(&b.instance));
            Err(ApplyFailure { succeeded, errors })
        }
    }

    /// Delete instances together with their instance storage.
    ///
    /// On failure the instances that were deleted are carried by
    /// [`ApplyFailure::succeeded`].
    pub async fn delete(&self, instances: Vec<AppInstanceData>) -> Result<Vec<AppInstanceData>, ApplyFailure> {
        let instances = instances
            .into_iter()
            .map(|mut data| {
                data.next_action = NextAction::Delete;
                data.delete_instance_storage = true;
                data
            })
            .collect();
        self.apply(instances, "").await
    }

    async fn run(&self, data: &AppInstanceData, catalog: &str) -> Result<(), ApplyError> {
        match data.next_action {
            NextAction::None => Ok(()),
            NextAction::Create => self.create_instance(data, catalog).await,
            NextAction::Upgrade => self.upgrade_instance(data).await,
            NextAction::Recreate => {
                self.delete_instance(data).await?;
                self.create_instance(data, catalog)
                    .await
                    .map_err(ApplyError::into_recreate)
            }
            NextAction::Delete => self.delete_instance(data).await,
        }
    }

    fn annotations_with_state(data: &AppInstanceData) -> apphc_core::StringMap {
        let mut ann = data.annotations.clone();
        ann.insert(annotations::STATE.into(), data.state.as_str().into());
        ann
    }

    /// Create the application object from the catalog template and wait for it.
    pub async fn create_instance(&self, data: &AppInstanceData, catalog: &str) -> Result<(), ApplyError> {
        let backend = self.backend.as_ref();
        let name = data.instance_name.as_str();
        let namespace = data.target_namespace.as_str();
        let template = data.template_name();
        let version = data.requested_version.as_str();
        let failed = |e: &dyn std::fmt::Display| ApplyError::other(name, e);

        let template_version = backend
            .template_versions(catalog, template)
            .await
            .map_err(|e| failed(&e))?
            .into_iter()
            .find(|tv| tv.version == version)
            .ok_or_else(|| failed(&format!("version {version} for template {template} is invalid")))?;

        backend
            .ensure_namespace(namespace)
            .await
            .map_err(|e| failed(&e))?;
        storage::ensure_instance_storage(backend, &self.config, data)
            .await
            .map_err(|e| failed(&e))?;

        info!(instance = %name, %version, %namespace, "creating application");
        backend
            .create_app(&AppSpec {
                name: name.to_string(),
                namespace: namespace.to_string(),
                description: data.description.clone(),
                external_id: template_version.external_id,
                annotations: Self::annotations_with_state(data),
                labels: data.labels.clone(),
            })
            .await
            .map_err(|e| failed(&e))?;

        let budget = Duration::from_secs(self.config.create_timeout_secs);
        let tick = Duration::from_millis(self.config.create_poll_ms);
        let deployed = wait::poll_until(budget, tick, || async move {
            let app = backend.get_app(namespace, name).await?;
            Ok(app.filter(|a| a.notes.as_deref().is_some_and(|n| !n.is_empty())))
        })
        .await
        .map_err(|e| failed(&e))?;
        if deployed.is_none() {
            return Err(failed(&"timed out waiting for application"));
        }

        post_deploy::run(backend, &self.config, data).await?;
        info!(instance = %name, %version, "application created");
        Ok(())
    }

    /// Move an existing application object to the requested template version.
    pub async fn upgrade_instance(&self, data: &AppInstanceData) -> Result<(), ApplyError> {
        let backend = self.backend.as_ref();
        let name = data.instance_name.as_str();
        let namespace = data.target_namespace.as_str();
        let version = data.requested_version.as_str();
        let failed = |e: &dyn std::fmt::Display| ApplyError::other(name, e);

        let app = backend
            .get_app(namespace, name)
            .await
            .map_err(|e| failed(&e))?
            .ok_or_else(|| failed(&format!("application {name} not found")))?;
        let target = app
            .external_id
            .parse::<ExternalId>()
            .map_err(|e| failed(&e))?
            .with_version(version);
        let template_version = backend
            .template_version_by_external_id(&target.to_string())
            .await
            .map_err(|e| failed(&e))?
            .ok_or_else(|| failed(&format!("version {version} not valid for app")))?;

        backend
            .update_app_metadata(namespace, name, &Self::annotations_with_state(data), &data.labels)
            .await
            .map_err(|e| failed(&e))?;
        info!(instance = %name, from = %data.current_version, to = %version, "upgrading application");
        backend
            .upgrade_app(namespace, name, &template_version.external_id)
            .await
            .map_err(|e| failed(&e))?;

        if data.has_instance_storage() {
            let volume = apphc_core::naming::instance_volume_name(name);
            storage::wait_for_volume(backend, &self.config, &volume, VolumeTarget::Bound)
                .await
                .map_err(|e| failed(&e))?;
        }

        post_deploy::run(backend, &self.config, data).await?;
        info!(instance = %name, %version, "application upgraded");
        Ok(())
    }

    /// Delete the workload and the application object, then optionally the
    /// instance storage. An already absent application is not an error.
    pub async fn delete_instance(&self, data: &AppInstanceData) -> Result<(), ApplyError> {
        let backend = self.backend.as_ref();
        let name = data.instance_name.as_str();
        let namespace = data.target_namespace.as_str();
        let failed = |e: &dyn std::fmt::Display| ApplyError::other(name, e);

        backend
            .delete_workload(namespace, name)
            .await
            .map_err(|e| failed(&e))?;
        if backend
            .get_app(namespace, name)
            .await
            .map_err(|e| failed(&e))?
            .is_none()
        {
            debug!(instance = %name, "application already absent");
            return Ok(());
        }

        info!(instance = %name, version = %data.current_version, "deleting application");
        backend
            .delete_app(namespace, name)
            .await
            .map_err(|e| failed(&e))?;

        let budget = Duration::from_secs(self.config.delete_timeout_secs);
        let tick = Duration::from_millis(self.config.delete_poll_ms);
        let gone = wait::poll_until(budget, tick, || async move {
            Ok(backend.get_app(namespace, name).await?.is_none().then_some(()))
        })
        .await
        .map_err(|e| failed(&e))?;
        if gone.is_none() {
            return Err(failed(&format!(
                "timed out waiting for deleting application instance {name}-{}",
                data.current_version
            )));
        }

        if data.delete_instance_storage {
            storage::delete_instance_storage(backend, &self.config, data)
                .await
                .map_err(|e| failed(&e))?;
        }
        Ok(())
    }
}

/// A panicked or cancelled instance task, attributed to its instance.
fn task_failure(names: &HashMap<Id, String>, e: JoinError) -> ApplyError {
    let instance = names.get(&e.id()).map(String::as_str).unwrap_or_default();
    warn!(%instance, error = %e, "instance task aborted");
    ApplyError::other(instance, format!("instance task aborted: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApplyErrorKind;
    use apphc_backend::MemoryBackend;
    use apphc_core::{AppRequest, InstanceState};

    fn engine(backend: &MemoryBackend) -> Engine {
        let config = EngineConfig {
            launch_stagger_ms: 10,
            create_timeout_secs: 5,
            create_poll_ms: 100,
            delete_poll_ms: 100,
            volume_poll_ms: 100,
            readiness_error_secs: 2,
            readiness_poll_ms: 100,
            ..Default::default()
        };
        Engine::new(Arc::new(backend.clone()), config)
    }

    fn instances(groups: &[&str], version: &str) -> Vec<AppInstanceData> {
        let req = AppRequest::new("foo", version).with_groups(groups);
        crate::aggregator::build_desired(&req)
            .into_iter()
            .map(|mut data| {
                data.annotations
                    .insert(annotations::STATE.into(), "enabled".into());
                data
            })
            .collect()
    }

    fn publish(backend: &MemoryBackend, groups: &[&str], version: &str) {
        for g in groups {
            backend.publish_template("apps", &format!("foo-{g}"), version);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn creates_every_instance() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1", "g2"], "1.0.0");
        let done = engine(&backend)
            .apply(instances(&["g2", "g1"], "1.0.0"), "apps")
            .await
            .unwrap();

        let names: Vec<&str> = done.iter().map(|d| d.instance_name.as_str()).collect();
        assert_eq!(names, vec!["foo-g1", "foo-g2"]);
        let app = backend.find_app("foo-g1").unwrap();
        assert_eq!(app.external_id, ExternalId::new("apps", "foo-g1", "1.0.0").to_string());
        assert_eq!(app.annotations[annotations::STATE], "enabled");
        assert!(backend.has_namespace("foo"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_version_fails_only_that_instance() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        let failure = engine(&backend)
            .apply(instances(&["g1", "g2"], "1.0.0"), "apps")
            .await
            .unwrap_err();

        assert_eq!(failure.succeeded.len(), 1);
        assert_eq!(failure.errors.len(), 1);
        assert_eq!(failure.errors[0].instance, "foo-g2");
        assert_eq!(failure.errors[0].message, "version 1.0.0 for template foo-g2 is invalid");
        assert!(!failure.is_rollback_eligible());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_notes_time_out() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        backend.withhold_notes("foo-g1");
        let failure = engine(&backend)
            .apply(instances(&["g1"], "1.0.0"), "apps")
            .await
            .unwrap_err();
        assert_eq!(failure.errors[0].message, "timed out waiting for application");
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_instances_are_not_touched() {
        let backend = MemoryBackend::new();
        let mut todo = instances(&["g1"], "1.0.0");
        todo[0].next_action = NextAction::None;
        let done = engine(&backend).apply(todo, "apps").await.unwrap();
        assert!(done.is_empty());
        assert!(backend.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_moves_external_id() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        publish(&backend, &["g1"], "2.0.0");
        let engine = engine(&backend);
        engine
            .apply(instances(&["g1"], "1.0.0"), "apps")
            .await
            .unwrap();

        let mut todo = instances(&["g1"], "2.0.0");
        todo[0].current_version = "1.0.0".into();
        todo[0].next_action = NextAction::Upgrade;
        engine.apply(todo, "apps").await.unwrap();

        let app = backend.find_app("foo-g1").unwrap();
        assert_eq!(app.external_id, ExternalId::new("apps", "foo-g1", "2.0.0").to_string());
        assert_eq!(app.annotations[annotations::VERSION], "2.0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_to_unknown_version_fails() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        let engine = engine(&backend);
        engine
            .apply(instances(&["g1"], "1.0.0"), "apps")
            .await
            .unwrap();

        let mut todo = instances(&["g1"], "3.0.0");
        todo[0].next_action = NextAction::Upgrade;
        let failure = engine.apply(todo, "apps").await.unwrap_err();
        assert_eq!(failure.errors[0].message, "version 3.0.0 not valid for app");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recreate_is_classified() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        let engine = engine(&backend);
        engine
            .apply(instances(&["g1"], "1.0.0"), "apps")
            .await
            .unwrap();

        backend.fail_creates("foo-g1", 1);
        let mut todo = instances(&["g1"], "1.0.0");
        todo[0].current_version = "1.0.0".into();
        todo[0].next_action = NextAction::Recreate;
        let failure = engine.apply(todo, "apps").await.unwrap_err();

        assert_eq!(failure.errors[0].kind, ApplyErrorKind::RecreateFailure);
        assert!(failure.is_rollback_eligible());
        assert!(backend.find_app("foo-g1").is_none());
        assert!(
            backend
                .operations()
                .contains(&"delete_app foo/foo-g1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pods_fail_readiness() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        backend.set_unready("foo-g1", "ImagePullBackOff");
        let failure = engine(&backend)
            .apply(instances(&["g1"], "1.0.0"), "apps")
            .await
            .unwrap_err();
        assert_eq!(failure.errors[0].kind, ApplyErrorKind::ReadinessTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_instance_is_created_without_workload() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        let mut todo = instances(&["g1"], "1.0.0");
        todo[0].state = InstanceState::Disabled;
        engine(&backend).apply(todo, "apps").await.unwrap();

        assert!(backend.find_app("foo-g1").is_some());
        assert!(!backend.has_workload("foo", "foo-g1"));
        assert_eq!(
            backend.find_app("foo-g1").unwrap().annotations[annotations::STATE],
            "disabled"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_app_and_storage() {
        let backend = MemoryBackend::new();
        publish(&backend, &["g1"], "1.0.0");
        let engine = engine(&backend);
        let mut todo = instances(&["g1"], "1.0.0");
        todo[0].instance_storage_size = Some(2);
        engine.apply(todo.clone(), "apps").await.unwrap();
        assert!(backend.volume("foo-g1-pv").is_some());

        engine.delete(todo).await.unwrap();
        assert!(backend.find_app("foo-g1").is_none());
        assert!(backend.volume("foo-g1-pv").is_none());
        assert!(backend.claim("foo", "foo-g1-pvc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_absent_instance_succeeds() {
        let backend = MemoryBackend::new();
        let done = engine(&backend)
            .delete(instances(&["g1"], "1.0.0"))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
    }

    #[tokio::test]
    async fn panicked_task_names_its_instance() {
        let mut tasks = JoinSet::<()>::new();
        let mut names = HashMap::new();
        let handle = tasks.spawn(async { panic!("backend client bug") });
        names.insert(handle.id(), "foo-g1".to_string());

        let joined = tasks.join_next().await.unwrap();
        let error = task_failure(&names, joined.unwrap_err());
        assert_eq!(error.instance, "foo-g1");
        assert_eq!(error.kind, ApplyErrorKind::Other);
        assert!(error.message.contains("instance task aborted"));
    }
}
