//! Backend object types.

use serde::{Deserialize, Serialize};

use apphc_core::{DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_REQUEST_MIB, ResourceLimits, StringMap};

/// Application object as stored by the cluster backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppObject {
    pub name: String,
    pub namespace: String,
    pub description: String,
    /// Catalog reference, see [`crate::ExternalId`].
    pub external_id: String,
    pub annotations: StringMap,
    pub labels: StringMap,
    /// Post-creation metadata populated by the backend once the chart renders.
    pub notes: Option<String>,
}

/// Input for creating an application object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub external_id: String,
    pub annotations: StringMap,
    pub labels: StringMap,
}

/// Workload (deployment, cron job, or job) created for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub kind: String,
}

/// A pod belonging to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub workload_id: String,
    pub state: PodState,
    pub transitioning: bool,
    pub transitioning_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodState {
    Running,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumePhase {
    Available,
    Bound,
    Released,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub name: String,
    pub host_path: String,
    pub size_gib: u32,
    pub phase: VolumePhase,
    /// `Retain` for every volume the controller creates.
    pub reclaim_policy: String,
}

impl PersistentVolume {
    pub fn host_path(name: &str, host_path: &str, size_gib: u32) -> Self {
        Self {
            name: name.to_string(),
            host_path: host_path.to_string(),
            size_gib,
            phase: VolumePhase::Available,
            reclaim_policy: "Retain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPhase {
    Pending,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub name: String,
    pub namespace: String,
    pub volume_name: String,
    pub size_gib: u32,
    pub phase: ClaimPhase,
}

/// A template version indexed by the backend from a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub catalog: String,
    pub template: String,
    pub version: String,
    pub external_id: String,
}

/// Per-container limits of a namespace. Containers without explicit requests
/// get the default ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRange {
    pub namespace: String,
    pub default_cpu_request: f64,
    pub default_memory_request_mib: u32,
    /// CPU cores; `None` when unbounded.
    pub max_cpu: Option<f64>,
    pub max_memory_mib: Option<u32>,
}

impl LimitRange {
    pub fn new(namespace: &str, limits: &ResourceLimits) -> Self {
        Self {
            namespace: namespace.to_string(),
            default_cpu_request: DEFAULT_CPU_REQUEST,
            default_memory_request_mib: DEFAULT_MEMORY_REQUEST_MIB,
            max_cpu: (limits.cpu > 0.0).then_some(limits.cpu),
            max_memory_mib: (limits.memory > 0).then_some(limits.memory),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu: self.max_cpu.unwrap_or_default(),
            memory: self.max_memory_mib.unwrap_or_default(),
        }
    }
}

// ── Cluster ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Cordoned,
    Draining,
    Drained,
}

/// A cluster node with its capacity and what is requested of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub master: bool,
    pub worker: bool,
    pub etcd: bool,
    pub external_ip: String,
    pub state: NodeState,
    pub cpu_total: f64,
    pub cpu_requested: f64,
    pub memory_total_mib: u32,
    pub memory_requested_mib: u32,
    pub storage_total_gib: u32,
    pub storage_free_gib: u32,
    /// Conditions currently reported in error.
    pub errors: Vec<String>,
}

/// Cluster-wide capacity and requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: String,
    pub name: String,
    pub created: String,
    pub cpu_total: f64,
    pub cpu_requested: f64,
    pub memory_total_mib: u32,
    pub memory_requested_mib: u32,
    pub errors: Vec<String>,
}

impl ClusterSummary {
    pub fn memory_free_mib(&self) -> u32 {
        self.memory_total_mib.saturating_sub(self.memory_requested_mib)
    }
}
