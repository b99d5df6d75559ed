//! In-process cluster backend.
//!
//! Keeps every object in memory behind one mutex. Used by the daemon's
//! standalone mode and by tests, which drive its fault-injection knobs to
//! simulate failed creates, stuck pods, or an unreachable API.
//!
//! Catalog indexing mirrors a real cluster manager: a catalog registered with
//! [`MemoryBackend::with_catalog_root`] is scanned on `refresh_catalog`, and
//! every `<app>/<template>/<version>/` directory becomes an indexed template
//! version.
//!
//! [`MemoryBackend::new`] starts with a single schedulable master node; more
//! can be seeded with [`MemoryBackend::with_node`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use apphc_core::{Cycle, DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_REQUEST_MIB, QuotaSpec, StringMap, annotations};

use crate::backend::ClusterBackend;
use crate::error::{BackendError, BackendResult};
use crate::external_id::ExternalId;
use crate::model::*;
use crate::registry::ImageRegistry;

type NsKey = (String, String);

const LOCAL_NODE: &str = "apphc-local";
const NODE_CPUS: f64 = 4.0;
const NODE_MEMORY_MIB: u32 = 8192;
const NODE_STORAGE_GIB: u32 = 100;

fn ns_key(namespace: &str, name: &str) -> NsKey {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining forced failures of `create_app`, per app name.
    create_failures: HashMap<String, u32>,
    /// Remaining forced failures of `upgrade_app`, per app name.
    upgrade_failures: HashMap<String, u32>,
    /// Remaining forced failures of `delete_app`, per app name.
    delete_failures: HashMap<String, u32>,
    /// Apps whose pods stay transitioning with the given message.
    unready: HashMap<String, String>,
    /// Apps whose post-creation notes never appear.
    withheld_notes: HashSet<String>,
    /// Nodes, by hostname, that never finish draining.
    stalled_drains: HashSet<String>,
    /// Every call fails.
    unavailable: bool,
}

#[derive(Debug, Default)]
struct State {
    apps: BTreeMap<NsKey, AppObject>,
    workloads: BTreeMap<NsKey, Workload>,
    pods: Vec<Pod>,
    volumes: BTreeMap<String, PersistentVolume>,
    claims: BTreeMap<NsKey, VolumeClaim>,
    templates: BTreeMap<(String, String), BTreeSet<String>>,
    catalog_roots: HashMap<String, PathBuf>,
    namespaces: BTreeMap<String, StringMap>,
    limit_ranges: BTreeMap<String, LimitRange>,
    quotas: BTreeMap<String, QuotaSpec>,
    nodes: BTreeMap<String, Node>,
    next_node: u32,
    created: String,
    registry_tags: HashMap<String, Vec<String>>,
    refreshes: HashMap<String, u32>,
    template_lookups: u32,
    faults: Faults,
    operations: Vec<String>,
}

impl State {
    fn record(&mut self, op: String) {
        debug!(%op, "memory backend operation");
        self.operations.push(op);
    }

    fn spawn_workload(&mut self, app: &AppObject) {
        let kind = app
            .annotations
            .get(annotations::CYCLE)
            .and_then(|c| c.parse::<Cycle>().ok())
            .map(|c| c.workload_kind())
            .unwrap_or("deployment");
        let workload = Workload {
            id: format!("{kind}:{}:{}", app.namespace, app.name),
            name: app.name.clone(),
            namespace: app.namespace.clone(),
            kind: kind.to_string(),
        };
        let (state, transitioning, message) = match self.faults.unready.get(&app.name) {
            Some(msg) => (PodState::Unavailable, true, msg.clone()),
            None => (PodState::Running, false, String::new()),
        };
        self.pods.retain(|p| p.workload_id != workload.id);
        self.pods.push(Pod {
            name: pod_name(&app.name),
            namespace: app.namespace.clone(),
            workload_id: workload.id.clone(),
            state,
            transitioning,
            transitioning_message: message,
        });
        self.workloads
            .insert(ns_key(&app.namespace, &app.name), workload);
    }

    fn add_node(&mut self, hostname: &str, master: bool, cpus: f64, memory_mib: u32) -> Node {
        self.next_node += 1;
        let node = Node {
            id: format!("node-{}", self.next_node),
            hostname: hostname.to_string(),
            master,
            worker: true,
            etcd: master,
            external_ip: format!("10.0.0.{}", self.next_node),
            state: NodeState::Active,
            cpu_total: cpus,
            cpu_requested: 0.0,
            memory_total_mib: memory_mib,
            memory_requested_mib: 0,
            storage_total_gib: NODE_STORAGE_GIB,
            storage_free_gib: NODE_STORAGE_GIB,
            errors: Vec::new(),
        };
        self.nodes.insert(node.id.clone(), node.clone());
        node
    }

    /// Nodes with every workload's default requests charged to the first
    /// active one.
    fn scheduled_nodes(&self) -> Vec<Node> {
        let workloads = self.workloads.len() as u32;
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        if let Some(node) = nodes.iter_mut().find(|n| n.state == NodeState::Active) {
            node.cpu_requested = DEFAULT_CPU_REQUEST * f64::from(workloads);
            node.memory_requested_mib = DEFAULT_MEMORY_REQUEST_MIB * workloads;
        }
        nodes
    }

    fn node_mut(&mut self, id: &str) -> BackendResult<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| BackendError::not_found("node", id))
    }

    fn remove_workload(&mut self, namespace: &str, name: &str) -> bool {
        match self.workloads.remove(&ns_key(namespace, name)) {
            Some(workload) => {
                self.pods.retain(|p| p.workload_id != workload.id);
                true
            }
            None => false,
        }
    }
}

/// Cluster backend kept entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default().with_node(LOCAL_NODE, true, NODE_CPUS, NODE_MEMORY_MIB)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state, failing when the backend is marked unavailable.
    fn live(&self) -> BackendResult<MutexGuard<'_, State>> {
        let state = self.state();
        if state.faults.unavailable {
            return Err(BackendError::Unavailable("memory backend offline".into()));
        }
        Ok(state)
    }

    /// Index `root/*/*/*` on every refresh of `catalog`.
    pub fn with_catalog_root(self, catalog: &str, root: impl Into<PathBuf>) -> Self {
        self.state()
            .catalog_roots
            .insert(catalog.to_string(), root.into());
        self
    }

    // ── Seeding ─────────────────────────────────────────────────

    pub fn with_node(self, hostname: &str, master: bool, cpus: f64, memory_mib: u32) -> Self {
        {
            let mut state = self.state();
            if state.created.is_empty() {
                state.created = chrono::Utc::now().to_rfc3339();
            }
            state.add_node(hostname, master, cpus, memory_mib);
        }
        self
    }

    pub fn publish_template(&self, catalog: &str, template: &str, version: &str) {
        self.state()
            .templates
            .entry((catalog.to_string(), template.to_string()))
            .or_default()
            .insert(version.to_string());
    }

    /// Insert a running application together with its workload and pod.
    pub fn insert_app(&self, app: AppObject) {
        let mut state = self.state();
        state
            .namespaces
            .entry(app.namespace.clone())
            .or_default();
        state.spawn_workload(&app);
        state.apps.insert(ns_key(&app.namespace, &app.name), app);
    }

    pub fn set_registry_tags(&self, repository: &str, tags: &[&str]) {
        self.state().registry_tags.insert(
            repository.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
    }

    // ── Fault injection ─────────────────────────────────────────

    /// Fail the next `times` creations of the named app.
    pub fn fail_creates(&self, app: &str, times: u32) {
        self.state()
            .faults
            .create_failures
            .insert(app.to_string(), times);
    }

    /// Fail the next `times` upgrades of the named app.
    pub fn fail_upgrades(&self, app: &str, times: u32) {
        self.state()
            .faults
            .upgrade_failures
            .insert(app.to_string(), times);
    }

    /// Fail the next `times` deletions of the named app.
    pub fn fail_deletes(&self, app: &str, times: u32) {
        self.state()
            .faults
            .delete_failures
            .insert(app.to_string(), times);
    }

    /// Keep pods of the named app transitioning with `message`.
    pub fn set_unready(&self, app: &str, message: &str) {
        let mut state = self.state();
        state
            .faults
            .unready
            .insert(app.to_string(), message.to_string());
        for pod in state.pods.iter_mut().filter(|p| p.name == pod_name(app)) {
            pod.state = PodState::Unavailable;
            pod.transitioning = true;
            pod.transitioning_message = message.to_string();
        }
    }

    pub fn clear_unready(&self, app: &str) {
        let mut state = self.state();
        state.faults.unready.remove(app);
        for pod in state.pods.iter_mut().filter(|p| p.name == pod_name(app)) {
            pod.state = PodState::Running;
            pod.transitioning = false;
            pod.transitioning_message.clear();
        }
    }

    pub fn withhold_notes(&self, app: &str) {
        self.state()
            .faults
            .withheld_notes
            .insert(app.to_string());
    }

    /// Leave the named node `Draining` forever once a drain starts.
    pub fn stall_drain(&self, hostname: &str) {
        self.state()
            .faults
            .stalled_drains
            .insert(hostname.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().faults.unavailable = unavailable;
    }

    // ── Inspection ──────────────────────────────────────────────

    /// Mutating operations performed so far, in order.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    pub fn apps(&self) -> Vec<AppObject> {
        self.state().apps.values().cloned().collect()
    }

    pub fn find_app(&self, name: &str) -> Option<AppObject> {
        self.state()
            .apps
            .values()
            .find(|a| a.name == name)
            .cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state().namespaces.contains_key(name)
    }

    pub fn has_workload(&self, namespace: &str, name: &str) -> bool {
        self.state()
            .workloads
            .contains_key(&ns_key(namespace, name))
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state().volumes.get(name).cloned()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<VolumeClaim> {
        self.state().claims.get(&ns_key(namespace, name)).cloned()
    }

    pub fn limit_range(&self, namespace: &str) -> Option<LimitRange> {
        self.state().limit_ranges.get(namespace).cloned()
    }

    pub fn quota(&self, namespace: &str) -> Option<QuotaSpec> {
        self.state().quotas.get(namespace).cloned()
    }

    pub fn node(&self, hostname: &str) -> Option<Node> {
        self.state()
            .nodes
            .values()
            .find(|n| n.hostname == hostname)
            .cloned()
    }

    /// Number of `template_versions` calls served.
    pub fn template_lookups(&self) -> u32 {
        self.state().template_lookups
    }

    pub fn refresh_count(&self, catalog: &str) -> u32 {
        self.state().refreshes.get(catalog).copied().unwrap_or(0)
    }
}

/// Collect `(template, version)` pairs laid out as `root/<app>/<template>/<version>`.
fn scan_catalog(root: &Path) -> Vec<(String, String)> {
    fn subdirs(path: &Path) -> Vec<std::fs::DirEntry> {
        std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                    .collect()
            })
            .unwrap_or_default()
    }

    let mut found = Vec::new();
    for app in subdirs(root) {
        for template in subdirs(&app.path()) {
            let template_name = template.file_name().to_string_lossy().into_owned();
            for version in subdirs(&template.path()) {
                found.push((
                    template_name.clone(),
                    version.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
    }
    found
}

fn pod_name(app: &str) -> String {
    format!("{app}-0")
}

fn matches_labels(labels: &StringMap, filter: &StringMap) -> bool {
    filter.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl ClusterBackend for MemoryBackend {
    async fn list_apps(&self, labels: &StringMap) -> BackendResult<Vec<AppObject>> {
        let state = self.live()?;
        Ok(state
            .apps
            .values()
            .filter(|a| matches_labels(&a.labels, labels))
            .cloned()
            .collect())
    }

    async fn get_app(&self, namespace: &str, name: &str) -> BackendResult<Option<AppObject>> {
        Ok(self.live()?.apps.get(&ns_key(namespace, name)).cloned())
    }

    async fn create_app(&self, spec: &AppSpec) -> BackendResult<AppObject> {
        let mut state = self.live()?;
        if let Some(remaining) = state.faults.create_failures.get_mut(&spec.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Request(format!(
                    "cannot create application {}",
                    spec.name
                )));
            }
        }
        let key = ns_key(&spec.namespace, &spec.name);
        if state.apps.contains_key(&key) {
            return Err(BackendError::AlreadyExists {
                kind: "application",
                name: spec.name.clone(),
            });
        }

        let notes = (!state.faults.withheld_notes.contains(&spec.name))
            .then(|| format!("{} deployed", spec.name));
        let app = AppObject {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            description: spec.description.clone(),
            external_id: spec.external_id.clone(),
            annotations: spec.annotations.clone(),
            labels: spec.labels.clone(),
            notes,
        };
        state.spawn_workload(&app);
        state.apps.insert(key, app.clone());
        state.record(format!("create_app {}/{}", spec.namespace, spec.name));
        Ok(app)
    }

    async fn update_app_metadata(
        &self,
        namespace: &str,
        name: &str,
        annotations: &StringMap,
        labels: &StringMap,
    ) -> BackendResult<()> {
        let mut state = self.live()?;
        let app = state
            .apps
            .get_mut(&ns_key(namespace, name))
            .ok_or_else(|| BackendError::not_found("application", name))?;
        app.annotations = annotations.clone();
        app.labels = labels.clone();
        state.record(format!("update_app_metadata {namespace}/{name}"));
        Ok(())
    }

    async fn upgrade_app(&self, namespace: &str, name: &str, external_id: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if let Some(remaining) = state.faults.upgrade_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Request(format!("cannot upgrade application {name}")));
            }
        }
        let app = state
            .apps
            .get_mut(&ns_key(namespace, name))
            .ok_or_else(|| BackendError::not_found("application", name))?;
        app.external_id = external_id.to_string();
        let app = app.clone();
        state.spawn_workload(&app);
        state.record(format!("upgrade_app {namespace}/{name} {external_id}"));
        Ok(())
    }

    async fn delete_app(&self, namespace: &str, name: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if let Some(remaining) = state.faults.delete_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Request(format!("cannot delete application {name}")));
            }
        }
        if state.apps.remove(&ns_key(namespace, name)).is_none() {
            return Err(BackendError::not_found("application", name));
        }
        state.remove_workload(namespace, name);
        state.record(format!("delete_app {namespace}/{name}"));
        Ok(())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> BackendResult<Option<Workload>> {
        Ok(self.live()?.workloads.get(&ns_key(namespace, name)).cloned())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.remove_workload(namespace, name) {
            state.record(format!("delete_workload {namespace}/{name}"));
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, workload_id: &str) -> BackendResult<Vec<Pod>> {
        let state = self.live()?;
        Ok(state
            .pods
            .iter()
            .filter(|p| p.namespace == namespace && p.workload_id == workload_id)
            .cloned()
            .collect())
    }

    async fn get_volume(&self, name: &str) -> BackendResult<Option<PersistentVolume>> {
        Ok(self.live()?.volumes.get(name).cloned())
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.volumes.contains_key(&volume.name) {
            return Err(BackendError::AlreadyExists {
                kind: "persistent volume",
                name: volume.name.clone(),
            });
        }
        state.volumes.insert(volume.name.clone(), volume.clone());
        state.record(format!("create_volume {}", volume.name));
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.volumes.remove(name).is_some() {
            state.record(format!("delete_volume {name}"));
        }
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> BackendResult<Option<VolumeClaim>> {
        Ok(self.live()?.claims.get(&ns_key(namespace, name)).cloned())
    }

    async fn create_claim(&self, claim: &VolumeClaim) -> BackendResult<()> {
        let mut state = self.live()?;
        let mut claim = claim.clone();
        if let Some(volume) = state.volumes.get_mut(&claim.volume_name) {
            volume.phase = VolumePhase::Bound;
            claim.phase = ClaimPhase::Bound;
        }
        state.record(format!("create_claim {}/{}", claim.namespace, claim.name));
        state
            .claims
            .insert(ns_key(&claim.namespace, &claim.name), claim);
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if let Some(claim) = state.claims.remove(&ns_key(namespace, name)) {
            if let Some(volume) = state.volumes.get_mut(&claim.volume_name) {
                volume.phase = VolumePhase::Released;
            }
            state.record(format!("delete_claim {namespace}/{name}"));
        }
        Ok(())
    }

    async fn refresh_catalog(&self, catalog: &str) -> BackendResult<()> {
        let root = self.live()?.catalog_roots.get(catalog).cloned();
        let indexed = root.as_deref().map(scan_catalog).unwrap_or_default();

        let mut state = self.live()?;
        for (template, version) in indexed {
            state
                .templates
                .entry((catalog.to_string(), template))
                .or_default()
                .insert(version);
        }
        *state.refreshes.entry(catalog.to_string()).or_default() += 1;
        Ok(())
    }

    async fn template_versions(&self, catalog: &str, template: &str) -> BackendResult<Vec<TemplateVersion>> {
        let mut state = self.live()?;
        state.template_lookups += 1;
        let versions = state
            .templates
            .get(&(catalog.to_string(), template.to_string()))
            .map(|versions| {
                versions
                    .iter()
                    .map(|v| TemplateVersion {
                        catalog: catalog.to_string(),
                        template: template.to_string(),
                        version: v.clone(),
                        external_id: ExternalId::new(catalog, template, v).to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(versions)
    }

    async fn template_version_by_external_id(
        &self,
        external_id: &str,
    ) -> BackendResult<Option<TemplateVersion>> {
        let id: ExternalId = external_id.parse()?;
        let found = self
            .template_versions(&id.catalog, &id.template)
            .await?
            .into_iter()
            .find(|tv| tv.version == id.version);
        Ok(found)
    }

    async fn ensure_namespace(&self, name: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if !state.namespaces.contains_key(name) {
            state.namespaces.insert(name.to_string(), StringMap::new());
            state.record(format!("create_namespace {name}"));
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.namespaces.remove(name).is_some() {
            state.limit_ranges.remove(name);
            state.quotas.remove(name);
            state.record(format!("delete_namespace {name}"));
        }
        Ok(())
    }

    async fn namespace_annotations(&self, name: &str) -> BackendResult<StringMap> {
        self.live()?
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::not_found("namespace", name))
    }

    async fn set_namespace_annotation(&self, name: &str, key: &str, value: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        state
            .namespaces
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        state.record(format!("annotate_namespace {name} {key}"));
        Ok(())
    }

    async fn apply_limit_range(&self, limit_range: &LimitRange) -> BackendResult<()> {
        let mut state = self.live()?;
        state
            .limit_ranges
            .insert(limit_range.namespace.clone(), limit_range.clone());
        state.record(format!("apply_limit_range {}", limit_range.namespace));
        Ok(())
    }

    async fn get_limit_range(&self, namespace: &str) -> BackendResult<Option<LimitRange>> {
        Ok(self.live()?.limit_ranges.get(namespace).cloned())
    }

    async fn delete_limit_range(&self, namespace: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.limit_ranges.remove(namespace).is_some() {
            state.record(format!("delete_limit_range {namespace}"));
        }
        Ok(())
    }

    async fn apply_resource_quota(&self, quota: &QuotaSpec) -> BackendResult<()> {
        let mut state = self.live()?;
        if !state.namespaces.contains_key(&quota.namespace) {
            return Err(BackendError::not_found("namespace", quota.namespace.clone()));
        }
        state.quotas.insert(quota.namespace.clone(), quota.clone());
        state.record(format!("apply_resource_quota {}", quota.namespace));
        Ok(())
    }

    async fn get_resource_quota(&self, namespace: &str) -> BackendResult<Option<QuotaSpec>> {
        Ok(self.live()?.quotas.get(namespace).cloned())
    }

    async fn delete_resource_quota(&self, namespace: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.quotas.remove(namespace).is_none() {
            return Err(BackendError::not_found("resource quota", namespace));
        }
        state.record(format!("delete_resource_quota {namespace}"));
        Ok(())
    }

    async fn cluster_summary(&self) -> BackendResult<ClusterSummary> {
        let state = self.live()?;
        let nodes = state.scheduled_nodes();
        Ok(ClusterSummary {
            id: "local".to_string(),
            name: "local".to_string(),
            created: state.created.clone(),
            cpu_total: nodes.iter().map(|n| n.cpu_total).sum(),
            cpu_requested: nodes.iter().map(|n| n.cpu_requested).sum(),
            memory_total_mib: nodes.iter().map(|n| n.memory_total_mib).sum(),
            memory_requested_mib: nodes.iter().map(|n| n.memory_requested_mib).sum(),
            errors: nodes.iter().flat_map(|n| n.errors.clone()).collect(),
        })
    }

    async fn list_nodes(&self) -> BackendResult<Vec<Node>> {
        Ok(self.live()?.scheduled_nodes())
    }

    async fn register_node(&self, hostname: &str, master: bool) -> BackendResult<Node> {
        let mut state = self.live()?;
        if state.nodes.values().any(|n| n.hostname == hostname) {
            return Err(BackendError::AlreadyExists {
                kind: "node",
                name: hostname.to_string(),
            });
        }
        let node = state.add_node(hostname, master, NODE_CPUS, NODE_MEMORY_MIB);
        state.record(format!("register_node {hostname}"));
        Ok(node)
    }

    async fn cordon_node(&self, id: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        state.node_mut(id)?.state = NodeState::Cordoned;
        state.record(format!("cordon_node {id}"));
        Ok(())
    }

    async fn uncordon_node(&self, id: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        state.node_mut(id)?.state = NodeState::Active;
        state.record(format!("uncordon_node {id}"));
        Ok(())
    }

    async fn drain_node(&self, id: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        let stalled = state.faults.stalled_drains.clone();
        let node = state.node_mut(id)?;
        node.state = if stalled.contains(&node.hostname) {
            NodeState::Draining
        } else {
            NodeState::Drained
        };
        state.record(format!("drain_node {id}"));
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> BackendResult<()> {
        let mut state = self.live()?;
        if state.nodes.remove(id).is_none() {
            return Err(BackendError::not_found("node", id));
        }
        state.record(format!("delete_node {id}"));
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for MemoryBackend {
    async fn list_tags(&self, repository: &str) -> BackendResult<Vec<String>> {
        self.live()?
            .registry_tags
            .get(repository)
            .cloned()
            .ok_or_else(|| BackendError::not_found("repository", repository))
    }

    /// Repositories without registered tags accept any tag.
    async fn has_tag(&self, repository: &str, tag: &str) -> BackendResult<bool> {
        let state = self.live()?;
        Ok(state
            .registry_tags
            .get(repository)
            .is_none_or(|tags| tags.iter().any(|t| t == tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_spec(name: &str) -> AppSpec {
        let mut ann = StringMap::new();
        ann.insert(annotations::CYCLE.into(), "run_once".into());
        AppSpec {
            name: name.to_string(),
            namespace: "foo".to_string(),
            description: String::new(),
            external_id: ExternalId::new("apps", name, "1.0.0").to_string(),
            annotations: ann,
            labels: StringMap::new(),
        }
    }

    #[tokio::test]
    async fn create_spawns_workload_and_pod() {
        let backend = MemoryBackend::new();
        let app = backend.create_app(&app_spec("foo-g1")).await.unwrap();
        assert!(app.notes.is_some());

        let workload = backend.get_workload("foo", "foo-g1").await.unwrap().unwrap();
        assert_eq!(workload.kind, "job");
        let pods = backend.list_pods("foo", &workload.id).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert!(!pods[0].transitioning);

        let err = backend.create_app(&app_spec("foo-g1")).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn injected_create_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_creates("foo-g1", 1);
        assert!(backend.create_app(&app_spec("foo-g1")).await.is_err());
        assert!(backend.create_app(&app_spec("foo-g1")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_claim_releases_volume() {
        let backend = MemoryBackend::new();
        backend
            .create_volume(&PersistentVolume::host_path("foo-g1-pv", "/appdata/foo/foo-g1", 1))
            .await
            .unwrap();
        backend
            .create_claim(&VolumeClaim {
                name: "foo-g1-pvc".into(),
                namespace: "foo".into(),
                volume_name: "foo-g1-pv".into(),
                size_gib: 1,
                phase: ClaimPhase::Pending,
            })
            .await
            .unwrap();
        assert_eq!(backend.claim("foo", "foo-g1-pvc").unwrap().phase, ClaimPhase::Bound);
        assert_eq!(backend.volume("foo-g1-pv").unwrap().phase, VolumePhase::Bound);

        backend.delete_claim("foo", "foo-g1-pvc").await.unwrap();
        assert_eq!(backend.volume("foo-g1-pv").unwrap().phase, VolumePhase::Released);
    }

    #[tokio::test]
    async fn refresh_indexes_catalog_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("foo/foo-g1/1.0.0")).unwrap();
        std::fs::create_dir_all(dir.path().join("foo/foo-g1/1.1.0")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects/ab")).unwrap();

        let backend = MemoryBackend::new().with_catalog_root("apps", dir.path());
        assert!(backend.template_versions("apps", "foo-g1").await.unwrap().is_empty());

        backend.refresh_catalog("apps").await.unwrap();
        let versions = backend.template_versions("apps", "foo-g1").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(backend.refresh_count("apps"), 1);

        let found = backend
            .template_version_by_external_id("catalog://?catalog=apps&template=foo-g1&version=1.1.0")
            .await
            .unwrap();
        assert_eq!(found.unwrap().version, "1.1.0");
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        let err = backend.list_apps(&StringMap::new()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        backend.set_unavailable(false);
        assert!(backend.list_apps(&StringMap::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_charges_default_requests_per_workload() {
        let backend = MemoryBackend::new().with_node("worker-1", false, 2.0, 4096);
        backend.create_app(&app_spec("foo-g1")).await.unwrap();
        backend.create_app(&app_spec("foo-g2")).await.unwrap();

        let summary = backend.cluster_summary().await.unwrap();
        assert_eq!(summary.cpu_total, 6.0);
        assert!((summary.cpu_requested - 0.2).abs() < 1e-9);
        assert_eq!(summary.memory_free_mib(), 8192 + 4096 - 40);
        assert_eq!(backend.list_nodes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn node_lifecycle_and_stalled_drain() {
        let backend = MemoryBackend::new();
        let node = backend.register_node("worker-1", false).await.unwrap();
        let err = backend.register_node("worker-1", false).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists { .. }));

        backend.cordon_node(&node.id).await.unwrap();
        assert_eq!(backend.node("worker-1").unwrap().state, NodeState::Cordoned);
        backend.drain_node(&node.id).await.unwrap();
        assert_eq!(backend.node("worker-1").unwrap().state, NodeState::Drained);
        backend.delete_node(&node.id).await.unwrap();
        assert!(backend.node("worker-1").is_none());

        let node = backend.register_node("worker-2", false).await.unwrap();
        backend.stall_drain("worker-2");
        backend.drain_node(&node.id).await.unwrap();
        assert_eq!(backend.node("worker-2").unwrap().state, NodeState::Draining);
    }

    #[tokio::test]
    async fn quotas_need_a_namespace() {
        let backend = MemoryBackend::new();
        let quota = QuotaSpec {
            namespace: "foo".into(),
            cpu: 2.0,
            memory: 512,
        };
        let err = backend.apply_resource_quota(&quota).await.unwrap_err();
        assert!(err.is_not_found());

        backend.ensure_namespace("foo").await.unwrap();
        backend.apply_resource_quota(&quota).await.unwrap();
        assert_eq!(backend.get_resource_quota("foo").await.unwrap(), Some(quota));
        backend.delete_resource_quota("foo").await.unwrap();
        assert!(backend.delete_resource_quota("foo").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn registry_accepts_unknown_repositories() {
        let backend = MemoryBackend::new();
        assert!(backend.has_tag("nginx", "latest").await.unwrap());
        backend.set_registry_tags("nginx", &["1.25"]);
        assert!(!backend.has_tag("nginx", "latest").await.unwrap());
        assert!(backend.has_tag("nginx", "1.25").await.unwrap());
    }
}
