//! Inbound request types.

use serde::{Deserialize, Serialize};

use crate::types::{Cycle, InstanceState, StringMap};

/// Image requested for an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    pub repo: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub name: String,
    pub number: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// CPU request given to every container of a limited namespace.
pub const DEFAULT_CPU_REQUEST: f64 = 0.1;
/// Memory request (MiB) given to every container of a limited namespace.
pub const DEFAULT_MEMORY_REQUEST_MIB: u32 = 20;

/// Per-container resource ceilings of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU cores; 0 leaves CPU unbounded.
    pub cpu: f64,
    /// Memory in MiB; 0 leaves memory unbounded.
    pub memory: u32,
}

impl ResourceLimits {
    /// A limit below the default request could never be satisfied.
    pub fn validate(&self) -> Result<(), String> {
        if !self.cpu.is_finite() || self.cpu < 0.0 {
            return Err(format!("requested CPU limit value {} is invalid", self.cpu));
        }
        if self.cpu > 0.0 && self.cpu < DEFAULT_CPU_REQUEST {
            return Err(format!(
                "requested CPU limit value: {:.2}. The value must be at least {DEFAULT_CPU_REQUEST:.2}",
                self.cpu
            ));
        }
        if self.memory > 0 && self.memory < DEFAULT_MEMORY_REQUEST_MIB {
            return Err(format!(
                "requested memory value: {}. The value must be at least {DEFAULT_MEMORY_REQUEST_MIB}",
                self.memory
            ));
        }
        Ok(())
    }

    pub fn is_unbounded(&self) -> bool {
        self.cpu == 0.0 && self.memory == 0
    }
}

/// Create, update, or upgrade request for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppRequest {
    pub name: String,
    pub version: String,
    pub cycle: Cycle,
    pub root_group_id: Option<String>,
    pub group_ids: Vec<String>,
    pub state: InstanceState,
    pub description: String,
    pub image: ImageSpec,
    pub ports: Vec<PortSpec>,
    pub env_vars: StringMap,
    pub configs: StringMap,
    pub secrets: StringMap,
    pub annotations: StringMap,
    pub labels: StringMap,
    /// Instance volume size in GiB; 0 disables instance storage.
    pub persistent_storage: u32,
    /// Shared volume size in GiB; 0 disables shared storage.
    pub shared_storage: u32,
    /// Cron schedule, used by periodic applications.
    pub schedule: Option<String>,
    /// Reuse the last deployed chart values as a base (update path).
    pub reuse_values: bool,
    /// Namespace-wide container limits. Unset removes the limits, except on
    /// a reusing update, which keeps the current ones.
    pub limits: Option<ResourceLimits>,
}

impl Default for AppRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            cycle: Cycle::Daemon,
            root_group_id: None,
            group_ids: Vec::new(),
            state: InstanceState::Enabled,
            description: String::new(),
            image: ImageSpec::default(),
            ports: Vec::new(),
            env_vars: StringMap::new(),
            configs: StringMap::new(),
            secrets: StringMap::new(),
            annotations: StringMap::new(),
            labels: StringMap::new(),
            persistent_storage: 0,
            shared_storage: 0,
            schedule: None,
            reuse_values: false,
            limits: None,
        }
    }
}

impl AppRequest {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn with_groups(mut self, group_ids: &[&str]) -> Self {
        self.group_ids = group_ids.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_root_group(mut self, root_group_id: &str) -> Self {
        self.root_group_id = Some(root_group_id.to_string());
        self
    }

    pub fn with_cycle(mut self, cycle: Cycle) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_image(mut self, repo: &str, tag: &str) -> Self {
        self.image = ImageSpec {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self
    }

    pub fn with_limits(mut self, cpu: f64, memory: u32) -> Self {
        self.limits = Some(ResourceLimits { cpu, memory });
        self
    }

    pub fn root_group(&self) -> Option<&str> {
        self.root_group_id.as_deref().filter(|r| !r.is_empty())
    }

    pub fn filter(&self) -> AppFilter {
        AppFilter {
            name: Some(self.name.clone()),
            version: None,
            cycle: Some(self.cycle),
            root_group_id: self.root_group_id.clone(),
            group_ids: self.group_ids.clone(),
        }
    }
}

/// Selection criteria over running instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppFilter {
    pub name: Option<String>,
    pub version: Option<String>,
    pub cycle: Option<Cycle>,
    pub root_group_id: Option<String>,
    pub group_ids: Vec<String>,
}

impl AppFilter {
    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }
}

/// Delete instances of an application (or every application for bulk delete).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRequest {
    pub name: String,
    pub version: Option<String>,
    pub root_group_id: Option<String>,
    pub group_ids: Vec<String>,
    /// Also remove the persisted chart metadata.
    pub purge: bool,
}

impl DeleteRequest {
    pub fn filter(&self) -> AppFilter {
        AppFilter {
            name: (!self.name.is_empty()).then(|| self.name.clone()),
            version: self.version.clone(),
            cycle: None,
            root_group_id: self.root_group_id.clone(),
            group_ids: self.group_ids.clone(),
        }
    }
}

/// Remove catalog template versions of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteMetadataRequest {
    pub name: String,
    pub root_group_id: Option<String>,
    pub group_ids: Vec<String>,
    /// Limit removal to one version; all versions when unset.
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnableDisableRequest {
    /// Application name; empty addresses every application.
    pub name: String,
    pub root_group_id: Option<String>,
    pub group_ids: Vec<String>,
    pub enable: bool,
}

impl EnableDisableRequest {
    pub fn filter(&self) -> AppFilter {
        AppFilter {
            name: (!self.name.is_empty()).then(|| self.name.clone()),
            version: None,
            cycle: None,
            root_group_id: self.root_group_id.clone(),
            group_ids: self.group_ids.clone(),
        }
    }

    pub fn target_state(&self) -> InstanceState {
        if self.enable {
            InstanceState::Enabled
        } else {
            InstanceState::Disabled
        }
    }
}

// ── Cluster ────────────────────────────────────────────────────

/// Register a node with the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddNodeRequest {
    pub hostname: String,
    /// Control-plane and etcd roles in addition to worker.
    pub master: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveNodeRequest {
    pub hostname: String,
}

/// Scheduling state requested for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTargetState {
    /// Schedulable.
    #[default]
    Active,
    /// Cordoned; running pods stay.
    Unschedulable,
    /// Drained of every pod.
    Maintenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStateRequest {
    pub hostname: String,
    pub state: NodeTargetState,
}

/// Hard CPU and memory ceiling of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSpec {
    pub namespace: String,
    /// CPU cores; 0 leaves CPU unbounded.
    pub cpu: f64,
    /// Memory in MiB; 0 leaves memory unbounded.
    pub memory: u32,
}

impl QuotaSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() {
            return Err("quota namespace is required".to_string());
        }
        if !self.cpu.is_finite() || self.cpu < 0.0 {
            return Err(format!("quota CPU value {} is invalid", self.cpu));
        }
        if self.cpu == 0.0 && self.memory == 0 {
            return Err(format!("quota for {} sets neither CPU nor memory", self.namespace));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetQuotasRequest {
    pub quotas: Vec<QuotaSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteQuotasRequest {
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_from_json() {
        let req: AppRequest =
            serde_json::from_str(r#"{"name":"foo","version":"1.0.0","group_ids":["g1"]}"#).unwrap();
        assert_eq!(req.cycle, Cycle::Daemon);
        assert_eq!(req.state, InstanceState::Enabled);
        assert_eq!(req.group_ids, vec!["g1"]);
        assert!(!req.reuse_values);
    }

    #[test]
    fn port_protocol_defaults_to_tcp() {
        let port: PortSpec = serde_json::from_str(r#"{"number":8080}"#).unwrap();
        assert_eq!(port.protocol, "TCP");
        assert!(port.name.is_empty());
    }

    #[test]
    fn empty_root_group_is_ignored() {
        let req = AppRequest::new("foo", "1").with_root_group("");
        assert_eq!(req.root_group(), None);
    }

    #[test]
    fn limits_below_default_requests_are_rejected() {
        assert!(ResourceLimits { cpu: 0.05, memory: 0 }.validate().is_err());
        assert!(ResourceLimits { cpu: 0.0, memory: 10 }.validate().is_err());
        assert!(ResourceLimits { cpu: -1.0, memory: 0 }.validate().is_err());
        ResourceLimits { cpu: 0.5, memory: 128 }.validate().unwrap();
        assert!(ResourceLimits::default().is_unbounded());
    }

    #[test]
    fn quota_needs_namespace_and_a_ceiling() {
        let quota = QuotaSpec {
            namespace: "foo".into(),
            cpu: 2.0,
            memory: 0,
        };
        quota.validate().unwrap();
        assert!(QuotaSpec { namespace: String::new(), ..quota.clone() }.validate().is_err());
        assert!(QuotaSpec { cpu: 0.0, ..quota }.validate().is_err());
    }

    #[test]
    fn node_state_parses_snake_case() {
        let req: NodeStateRequest =
            serde_json::from_str(r#"{"hostname":"node1","state":"maintenance"}"#).unwrap();
        assert_eq!(req.state, NodeTargetState::Maintenance);
    }

    #[test]
    fn delete_filter_without_name_matches_all() {
        let req = DeleteRequest::default();
        assert_eq!(req.filter().name, None);
    }
}
