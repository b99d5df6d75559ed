//! The cluster backend contract.

use async_trait::async_trait;

use apphc_core::{QuotaSpec, StringMap};

use crate::error::BackendResult;
use crate::model::*;

/// Cluster management API used to execute instance lifecycle operations.
///
/// List operations take a label filter; an empty filter matches everything.
/// Create operations on namespaces and limit ranges are create-or-update.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    // ── Applications ────────────────────────────────────────────

    async fn list_apps(&self, labels: &StringMap) -> BackendResult<Vec<AppObject>>;

    async fn get_app(&self, namespace: &str, name: &str) -> BackendResult<Option<AppObject>>;

    async fn create_app(&self, spec: &AppSpec) -> BackendResult<AppObject>;

    /// Replace the annotations and labels of an application object.
    async fn update_app_metadata(
        &self,
        namespace: &str,
        name: &str,
        annotations: &StringMap,
        labels: &StringMap,
    ) -> BackendResult<()>;

    /// Move an application to another catalog reference.
    async fn upgrade_app(&self, namespace: &str, name: &str, external_id: &str) -> BackendResult<()>;

    async fn delete_app(&self, namespace: &str, name: &str) -> BackendResult<()>;

    // ── Workloads and pods ──────────────────────────────────────

    async fn get_workload(&self, namespace: &str, name: &str) -> BackendResult<Option<Workload>>;

    async fn delete_workload(&self, namespace: &str, name: &str) -> BackendResult<()>;

    async fn list_pods(&self, namespace: &str, workload_id: &str) -> BackendResult<Vec<Pod>>;

    // ── Storage ─────────────────────────────────────────────────

    async fn get_volume(&self, name: &str) -> BackendResult<Option<PersistentVolume>>;

    async fn create_volume(&self, volume: &PersistentVolume) -> BackendResult<()>;

    async fn delete_volume(&self, name: &str) -> BackendResult<()>;

    async fn get_claim(&self, namespace: &str, name: &str) -> BackendResult<Option<VolumeClaim>>;

    async fn create_claim(&self, claim: &VolumeClaim) -> BackendResult<()>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> BackendResult<()>;

    // ── Catalogs ────────────────────────────────────────────────

    /// Ask the backend to re-index a catalog source.
    async fn refresh_catalog(&self, catalog: &str) -> BackendResult<()>;

    /// Indexed versions of a template.
    async fn template_versions(&self, catalog: &str, template: &str) -> BackendResult<Vec<TemplateVersion>>;

    /// Resolve an external reference to an indexed template version.
    async fn template_version_by_external_id(
        &self,
        external_id: &str,
    ) -> BackendResult<Option<TemplateVersion>>;

    // ── Namespaces ──────────────────────────────────────────────

    async fn ensure_namespace(&self, name: &str) -> BackendResult<()>;

    async fn delete_namespace(&self, name: &str) -> BackendResult<()>;

    async fn namespace_annotations(&self, name: &str) -> BackendResult<StringMap>;

    async fn set_namespace_annotation(&self, name: &str, key: &str, value: &str) -> BackendResult<()>;

    // ── Resource controls ───────────────────────────────────────

    async fn apply_limit_range(&self, limit_range: &LimitRange) -> BackendResult<()>;

    async fn get_limit_range(&self, namespace: &str) -> BackendResult<Option<LimitRange>>;

    /// Removing an absent limit range succeeds.
    async fn delete_limit_range(&self, namespace: &str) -> BackendResult<()>;

    /// Fails with `NotFound` when the namespace does not exist.
    async fn apply_resource_quota(&self, quota: &QuotaSpec) -> BackendResult<()>;

    async fn get_resource_quota(&self, namespace: &str) -> BackendResult<Option<QuotaSpec>>;

    /// Fails with `NotFound` when the namespace has no quota.
    async fn delete_resource_quota(&self, namespace: &str) -> BackendResult<()>;

    // ── Cluster and nodes ───────────────────────────────────────

    async fn cluster_summary(&self) -> BackendResult<ClusterSummary>;

    async fn list_nodes(&self) -> BackendResult<Vec<Node>>;

    async fn register_node(&self, hostname: &str, master: bool) -> BackendResult<Node>;

    async fn cordon_node(&self, id: &str) -> BackendResult<()>;

    async fn uncordon_node(&self, id: &str) -> BackendResult<()>;

    /// Start evicting every pod; the node reports `Drained` once done.
    async fn drain_node(&self, id: &str) -> BackendResult<()>;

    async fn delete_node(&self, id: &str) -> BackendResult<()>;
}
