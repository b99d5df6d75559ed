//! Host-path volumes for instances and for applications' shared data.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use apphc_backend::{ClaimPhase, ClusterBackend, PersistentVolume, VolumeClaim, VolumePhase};
use apphc_core::config::EngineConfig;
use apphc_core::{AppInstanceData, naming};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::wait::poll_until;

/// Host directory under which application volumes are provisioned.
pub const APPDATA_ROOT: &str = "/appdata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeTarget {
    Bound,
    Removed,
}

impl fmt::Display for VolumeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeTarget::Bound => f.write_str("bound"),
            VolumeTarget::Removed => f.write_str("removed"),
        }
    }
}

/// Wait until a volume reaches `target`, within the volume budget.
pub async fn wait_for_volume(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    name: &str,
    target: VolumeTarget,
) -> OrchestratorResult<()> {
    let budget = Duration::from_secs(config.volume_timeout_secs);
    let tick = Duration::from_millis(config.volume_poll_ms);
    let reached = poll_until(budget, tick, || async move {
        let volume = backend.get_volume(name).await?;
        let done = match (target, volume) {
            (VolumeTarget::Removed, None) => true,
            (VolumeTarget::Bound, Some(v)) => v.phase == VolumePhase::Bound,
            _ => false,
        };
        Ok(done.then_some(()))
    })
    .await?;

    reached.ok_or_else(|| {
        OrchestratorError::DeadlineExceeded(format!("timed out waiting for PV {name} state {target}"))
    })
}

/// Make sure the instance volume and its claim exist and are bound.
///
/// A released volume left behind by an earlier claim is removed and
/// provisioned again.
pub async fn ensure_instance_storage(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    data: &AppInstanceData,
) -> OrchestratorResult<()> {
    let Some(size) = data.instance_storage_size.filter(|s| *s > 0) else {
        return Ok(());
    };
    let volume_name = naming::instance_volume_name(&data.instance_name);
    let claim_name = naming::instance_claim_name(&data.instance_name);
    let namespace = &data.target_namespace;

    let mut existing = backend.get_volume(&volume_name).await?;
    if existing
        .as_ref()
        .is_some_and(|v| v.phase == VolumePhase::Released)
    {
        info!(volume = %volume_name, "removing released volume");
        backend.delete_volume(&volume_name).await?;
        wait_for_volume(backend, config, &volume_name, VolumeTarget::Removed).await?;
        existing = None;
    }

    if existing.is_none() {
        let path = format!("{APPDATA_ROOT}/{}/{}", data.app_name(), data.instance_name);
        info!(volume = %volume_name, %path, size_gib = size, "creating instance volume");
        backend
            .create_volume(&PersistentVolume::host_path(&volume_name, &path, size))
            .await?;
    }

    if backend.get_claim(namespace, &claim_name).await?.is_none() {
        backend
            .create_claim(&VolumeClaim {
                name: claim_name,
                namespace: namespace.clone(),
                volume_name: volume_name.clone(),
                size_gib: size,
                phase: ClaimPhase::Pending,
            })
            .await?;
        wait_for_volume(backend, config, &volume_name, VolumeTarget::Bound).await?;
    }
    Ok(())
}

/// Delete a claim and its volume, waiting for the volume to disappear.
pub async fn delete_volume_pair(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    namespace: &str,
    volume_name: &str,
    claim_name: &str,
) -> OrchestratorResult<()> {
    debug!(%namespace, volume = %volume_name, claim = %claim_name, "deleting volume");
    backend.delete_claim(namespace, claim_name).await?;
    backend.delete_volume(volume_name).await?;
    wait_for_volume(backend, config, volume_name, VolumeTarget::Removed).await
}

pub async fn delete_instance_storage(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    data: &AppInstanceData,
) -> OrchestratorResult<()> {
    delete_volume_pair(
        backend,
        config,
        &data.target_namespace,
        &naming::instance_volume_name(&data.instance_name),
        &naming::instance_claim_name(&data.instance_name),
    )
    .await
}

/// Provision the application's shared volume, replacing it when resized.
pub async fn ensure_shared_storage(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    app_name: &str,
    namespace: &str,
    size: u32,
) -> OrchestratorResult<()> {
    let volume_name = naming::shared_volume_name(app_name);
    let claim_name = naming::shared_claim_name(app_name);

    match backend.get_volume(&volume_name).await? {
        Some(volume) if volume.size_gib == size && volume.phase != VolumePhase::Released => {
            if backend.get_claim(namespace, &claim_name).await?.is_none() {
                create_shared_claim(backend, config, namespace, &claim_name, &volume_name, size).await?;
            }
            return Ok(());
        }
        Some(volume) => {
            info!(volume = %volume_name, from = volume.size_gib, to = size, "replacing shared volume");
            delete_volume_pair(backend, config, namespace, &volume_name, &claim_name).await?;
        }
        None => {
            backend.delete_claim(namespace, &claim_name).await?;
        }
    }

    let path = format!("{APPDATA_ROOT}/{app_name}/shared");
    info!(volume = %volume_name, %path, size_gib = size, "creating shared volume");
    backend
        .create_volume(&PersistentVolume::host_path(&volume_name, &path, size))
        .await?;
    create_shared_claim(backend, config, namespace, &claim_name, &volume_name, size).await
}

async fn create_shared_claim(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    namespace: &str,
    claim_name: &str,
    volume_name: &str,
    size: u32,
) -> OrchestratorResult<()> {
    backend
        .create_claim(&VolumeClaim {
            name: claim_name.to_string(),
            namespace: namespace.to_string(),
            volume_name: volume_name.to_string(),
            size_gib: size,
            phase: ClaimPhase::Pending,
        })
        .await?;
    wait_for_volume(backend, config, volume_name, VolumeTarget::Bound).await
}

pub async fn delete_shared_storage(
    backend: &dyn ClusterBackend,
    config: &EngineConfig,
    app_name: &str,
    namespace: &str,
) -> OrchestratorResult<()> {
    delete_volume_pair(
        backend,
        config,
        namespace,
        &naming::shared_volume_name(app_name),
        &naming::shared_claim_name(app_name),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphc_backend::MemoryBackend;
    use apphc_core::annotations;

    fn instance(size: u32) -> AppInstanceData {
        let mut data = AppInstanceData {
            instance_name: "foo-g1".into(),
            target_namespace: "foo".into(),
            instance_storage_size: Some(size),
            ..Default::default()
        };
        data.annotations
            .insert(annotations::BASENAME.into(), "foo".into());
        data
    }

    fn config() -> EngineConfig {
        EngineConfig {
            volume_timeout_secs: 3,
            volume_poll_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn instance_volume_is_created_and_bound() {
        let backend = MemoryBackend::new();
        ensure_instance_storage(&backend, &config(), &instance(2))
            .await
            .unwrap();

        let volume = backend.volume("foo-g1-pv").unwrap();
        assert_eq!(volume.phase, VolumePhase::Bound);
        assert_eq!(volume.host_path, "/appdata/foo/foo-g1");
        assert_eq!(backend.claim("foo", "foo-g1-pvc").unwrap().phase, ClaimPhase::Bound);
    }

    #[tokio::test]
    async fn zero_size_provisions_nothing() {
        let backend = MemoryBackend::new();
        ensure_instance_storage(&backend, &config(), &instance(0))
            .await
            .unwrap();
        assert!(backend.operations().is_empty());
    }

    #[tokio::test]
    async fn released_volume_is_replaced() {
        let backend = MemoryBackend::new();
        let data = instance(2);
        ensure_instance_storage(&backend, &config(), &data).await.unwrap();
        backend.delete_claim("foo", "foo-g1-pvc").await.unwrap();
        assert_eq!(backend.volume("foo-g1-pv").unwrap().phase, VolumePhase::Released);

        ensure_instance_storage(&backend, &config(), &data).await.unwrap();
        assert_eq!(backend.volume("foo-g1-pv").unwrap().phase, VolumePhase::Bound);
        let creates = backend
            .operations()
            .iter()
            .filter(|op| *op == "create_volume foo-g1-pv")
            .count();
        assert_eq!(creates, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_volume_never_binds() {
        let backend = MemoryBackend::new();
        let err = wait_for_volume(&backend, &config(), "missing", VolumeTarget::Bound)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DeadlineExceeded(_)));
        assert_eq!(err.to_string(), "timed out waiting for PV missing state bound");
    }

    #[tokio::test]
    async fn shared_volume_is_resized() {
        let backend = MemoryBackend::new();
        ensure_shared_storage(&backend, &config(), "foo", "foo", 5)
            .await
            .unwrap();
        assert_eq!(backend.volume("foo-shared-pv").unwrap().host_path, "/appdata/foo/shared");

        ensure_shared_storage(&backend, &config(), "foo", "foo", 5)
            .await
            .unwrap();
        ensure_shared_storage(&backend, &config(), "foo", "foo", 8)
            .await
            .unwrap();
        assert_eq!(backend.volume("foo-shared-pv").unwrap().size_gib, 8);
        assert!(backend.claim("foo", "foo-shared-pvc").is_some());

        delete_shared_storage(&backend, &config(), "foo", "foo")
            .await
            .unwrap();
        assert!(backend.volume("foo-shared-pv").is_none());
        assert!(backend.claim("foo", "foo-shared-pvc").is_none());
    }
}
