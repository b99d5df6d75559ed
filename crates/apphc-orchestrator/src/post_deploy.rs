//! Steps run after an instance is deployed: wait for its pods, or stop it
//! when it is meant to be disabled.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use apphc_backend::{BackendError, BackendResult, ClusterBackend, PodState};
use apphc_core::AppInstanceData;
use apphc_core::config::EngineConfig;

use crate::error::{ApplyError, ApplyErrorKind};

/// Pods still pulling images get the longer readiness budget.
pub const CONTAINER_CREATING: &str = "ContainerCreating";

pub async fn run(backend: &dyn ClusterBackend, config: &EngineConfig, data: &AppInstanceData) -> Result<(), ApplyError> {
    if data.state.is_enabled() {
        wait_for_readiness(backend, config, data).await
    } else {
        disable(backend, &data.target_namespace, &data.instance_name)
            .await
            .map_err(|e| ApplyError::other(&data.instance_name, e))
    }
}

/// Remove the workload of a disabled instance, keeping the application object.
pub async fn disable(backend: &dyn ClusterBackend, namespace: &str, name: &str) -> BackendResult<()> {
    if backend.get_workload(namespace, name).await?.is_some() {
        info!(instance = %name, "disabling instance");
        backend.delete_workload(namespace, name).await?;
    }
    Ok(())
}

/// Poll the instance's pods until none is stuck transitioning.
///
/// The budget depends on the stuck pod's message and is measured from the
/// start of the wait.
pub async fn wait_for_readiness(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    data: &AppInstanceData,
) -> Result<(), ApplyError> {
    let name = &data.instance_name;
    let namespace = &data.target_namespace;
    let failed = |e: BackendError| ApplyError::other(name, e);

    let Some(workload) = backend.get_workload(namespace, name).await.map_err(failed)? else {
        debug!(instance = %name, "no workload, skipping readiness wait");
        return Ok(());
    };

    let started = Instant::now();
    let tick = Duration::from_millis(config.readiness_poll_ms);
    loop {
        let pods = backend
            .list_pods(namespace, &workload.id)
            .await
            .map_err(failed)?;
        let Some(stuck) = pods
            .iter()
            .find(|p| p.transitioning && p.state == PodState::Unavailable)
        else {
            debug!(instance = %name, elapsed_ms = started.elapsed().as_millis() as u64, "pods ready");
            return Ok(());
        };

        let budget = if stuck.transitioning_message == CONTAINER_CREATING {
            Duration::from_secs(config.readiness_creating_secs)
        } else {
            Duration::from_secs(config.readiness_error_secs)
        };
        if started.elapsed() > budget {
            return Err(ApplyError::new(
                name,
                ApplyErrorKind::ReadinessTimeout,
                format!("timed out waiting for pods readiness: {}", stuck.transitioning_message),
            ));
        }
        sleep(tick).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphc_backend::{AppObject, MemoryBackend};
    use apphc_core::{InstanceState, StringMap};

    fn deployed(backend: &MemoryBackend) -> AppInstanceData {
        backend.insert_app(AppObject {
            name: "foo-g1".into(),
            namespace: "foo".into(),
            description: String::new(),
            external_id: String::new(),
            annotations: StringMap::new(),
            labels: StringMap::new(),
            notes: None,
        });
        AppInstanceData {
            instance_name: "foo-g1".into(),
            target_namespace: "foo".into(),
            ..Default::default()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            readiness_creating_secs: 30,
            readiness_error_secs: 5,
            readiness_poll_ms: 1000,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_pods_pass_immediately() {
        let backend = MemoryBackend::new();
        let data = deployed(&backend);
        let started = Instant::now();
        run(&backend, &config(), &data).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn crashing_pods_use_short_budget() {
        let backend = MemoryBackend::new();
        let data = deployed(&backend);
        backend.set_unready("foo-g1", "CrashLoopBackOff");

        let started = Instant::now();
        let err = run(&backend, &config(), &data).await.unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::ReadinessTimeout);
        assert_eq!(err.message, "timed out waiting for pods readiness: CrashLoopBackOff");
        assert!(started.elapsed() > Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn creating_pods_use_long_budget() {
        let backend = MemoryBackend::new();
        let data = deployed(&backend);
        backend.set_unready("foo-g1", CONTAINER_CREATING);

        let started = Instant::now();
        let err = run(&backend, &config(), &data).await.unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::ReadinessTimeout);
        assert!(started.elapsed() > Duration::from_secs(30));
    }

    #[tokio::test]
    async fn disabled_instance_loses_its_workload() {
        let backend = MemoryBackend::new();
        let mut data = deployed(&backend);
        data.state = InstanceState::Disabled;
        run(&backend, &config(), &data).await.unwrap();
        assert!(!backend.has_workload("foo", "foo-g1"));
        assert!(backend.find_app("foo-g1").is_some());
    }
}
