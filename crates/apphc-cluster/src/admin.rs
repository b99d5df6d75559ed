//! Cluster administration: nodes, namespace quotas, and the cluster summary.
//!
//! Adding or removing a node takes its global lock, so neither runs beside
//! an upgrade or any application operation. Node state changes only exclude
//! each other and the global actions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use apphc_backend::{ClusterBackend, Node, NodeState};
use apphc_core::config::ClusterConfig;
use apphc_core::lock::{self, LockGuard, LockRegistry};
use apphc_core::{
    AddNodeRequest, DeleteQuotasRequest, InstanceState, NodeStateRequest, NodeTargetState, QuotaSpec,
    RemoveNodeRequest, Response, SetQuotasRequest, StringMap, annotations,
};

use crate::coordinator::UpgradeCoordinator;
use crate::error::{ClusterError, ClusterResult};
use crate::record::Upgrade;

// ── Cluster info ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub total: f64,
    pub allocated: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_mib: u32,
    pub allocated_mib: u32,
    pub free_mib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCondition {
    pub healthy: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppWorkload {
    pub name: String,
    pub number_of_instances: u32,
    /// At least one instance is enabled.
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workloads {
    pub number_of_apps: u32,
    pub number_of_instances: u32,
    pub number_of_active_apps: u32,
    pub number_of_active_instances: u32,
    pub apps: Vec<AppWorkload>,
}

/// Body of the cluster information response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: String,
    pub name: String,
    pub creation_date: String,
    pub cpu_cores: CpuUsage,
    pub memory: MemoryUsage,
    pub condition: ClusterCondition,
    pub last_upgrade_status: Option<Upgrade>,
    pub workloads: Workloads,
    pub number_of_nodes: u32,
    pub nodes: Vec<Node>,
}

/// Count instances per application basename.
fn count_workloads<'a>(apps: impl Iterator<Item = &'a StringMap>) -> Workloads {
    // name -> (instances, active instances)
    let mut per_app: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for ann in apps {
        let name = ann.get(annotations::BASENAME).cloned().unwrap_or_default();
        let enabled = ann
            .get(annotations::STATE)
            .and_then(|s| s.parse::<InstanceState>().ok())
            .unwrap_or_default()
            .is_enabled();
        let entry = per_app.entry(name).or_default();
        entry.0 += 1;
        if enabled {
            entry.1 += 1;
        }
    }

    let mut workloads = Workloads::default();
    for (name, (instances, active)) in per_app {
        workloads.number_of_apps += 1;
        workloads.number_of_instances += instances;
        workloads.number_of_active_instances += active;
        if active > 0 {
            workloads.number_of_active_apps += 1;
        }
        workloads.apps.push(AppWorkload {
            name,
            number_of_instances: instances,
            active: active > 0,
        });
    }
    workloads
}

// ── Manager ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClusterManager {
    backend: Arc<dyn ClusterBackend>,
    locks: LockRegistry,
    upgrade: UpgradeCoordinator,
    config: ClusterConfig,
}

impl ClusterManager {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        locks: LockRegistry,
        upgrade: UpgradeCoordinator,
        config: ClusterConfig,
    ) -> Self {
        Self {
            backend,
            locks,
            upgrade,
            config,
        }
    }

    pub fn upgrade(&self) -> &UpgradeCoordinator {
        &self.upgrade
    }

    fn lock(&self, key: &str, holder: &str) -> ClusterResult<LockGuard> {
        self.locks.acquire(key, holder).ok_or(ClusterError::Locked)
    }

    async fn find_node(&self, hostname: &str) -> ClusterResult<Node> {
        self.backend
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.hostname == hostname)
            .ok_or_else(|| ClusterError::NodeNotFound(hostname.to_string()))
    }

    /// Capacity, health, workloads, and nodes of the cluster.
    pub async fn info(&self) -> ClusterResult<Response> {
        if self.upgrade.in_progress() {
            return Ok(Response::in_progress("AppHoster cluster upgrade in progress"));
        }
        let summary = self.backend.cluster_summary().await?;
        let apps = self.backend.list_apps(&StringMap::new()).await?;
        let nodes = self.backend.list_nodes().await?;
        let last_upgrade_status = self.upgrade.last_upgrade().await?;

        let info = ClusterInfo {
            id: summary.id.clone(),
            name: summary.name.clone(),
            creation_date: summary.created.clone(),
            cpu_cores: CpuUsage {
                total: summary.cpu_total,
                allocated: summary.cpu_requested,
            },
            memory: MemoryUsage {
                total_mib: summary.memory_total_mib,
                allocated_mib: summary.memory_requested_mib,
                free_mib: summary.memory_free_mib(),
            },
            condition: ClusterCondition {
                healthy: summary.errors.is_empty(),
                errors: summary.errors,
            },
            last_upgrade_status,
            workloads: count_workloads(apps.iter().map(|a| &a.annotations)),
            number_of_nodes: nodes.len() as u32,
            nodes,
        };
        debug!(nodes = info.number_of_nodes, apps = info.workloads.number_of_apps, "cluster info collected");
        Ok(Response::success("Cluster information").with_body(&info))
    }

    // ── Nodes ───────────────────────────────────────────────────

    pub async fn add_node(&self, req: &AddNodeRequest) -> ClusterResult<Response> {
        if req.hostname.is_empty() {
            return Err(ClusterError::Validation("node hostname is required".into()));
        }
        let _guard = self.lock(lock::ADD_NODE, "add_node")?;
        let node = self.backend.register_node(&req.hostname, req.master).await?;
        info!(hostname = %node.hostname, id = %node.id, master = node.master, "node added");
        Ok(Response::success("The node was added").with_body(&node))
    }

    /// Drain the node, wait for it to empty, then remove it.
    pub async fn remove_node(&self, req: &RemoveNodeRequest) -> ClusterResult<Response> {
        let _guard = self.lock(lock::REMOVE_NODE, "remove_node")?;
        let node = self.find_node(&req.hostname).await?;
        info!(hostname = %node.hostname, id = %node.id, "draining node before removal");
        self.backend.drain_node(&node.id).await?;
        self.wait_drained(&node).await?;
        self.backend.delete_node(&node.id).await?;
        info!(hostname = %node.hostname, "node removed");
        Ok(Response::success("The node was deleted"))
    }

    pub async fn update_node_state(&self, req: &NodeStateRequest) -> ClusterResult<Response> {
        let _guard = self.lock(lock::UPDATE_NODE_STATE, "update_node_state")?;
        let node = self.find_node(&req.hostname).await?;
        match req.state {
            NodeTargetState::Active => self.backend.uncordon_node(&node.id).await?,
            NodeTargetState::Unschedulable => self.backend.cordon_node(&node.id).await?,
            NodeTargetState::Maintenance => {
                self.backend.drain_node(&node.id).await?;
                self.wait_drained(&node).await?;
            }
        }
        info!(hostname = %node.hostname, state = ?req.state, "node state changed");
        Ok(Response::success("The node was set to the new state"))
    }

    async fn wait_drained(&self, node: &Node) -> ClusterResult<()> {
        let timeout = Duration::from_secs(self.config.node_drain_timeout_secs);
        let poll = Duration::from_millis(self.config.node_poll_ms);
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.find_node(&node.hostname).await?;
            if current.state == NodeState::Drained {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(hostname = %node.hostname, state = ?current.state, "node drain timed out");
                return Err(ClusterError::DrainTimeout {
                    hostname: node.hostname.clone(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ── Quotas ──────────────────────────────────────────────────

    /// Create or replace the quota of every listed namespace.
    pub async fn set_quotas(&self, req: &SetQuotasRequest) -> ClusterResult<Response> {
        if req.quotas.is_empty() {
            return Err(ClusterError::Validation("no quotas given".into()));
        }
        for quota in &req.quotas {
            quota.validate().map_err(ClusterError::Validation)?;
        }
        for quota in &req.quotas {
            self.backend.apply_resource_quota(quota).await?;
            info!(namespace = %quota.namespace, cpu = quota.cpu, memory = quota.memory, "quota applied");
        }
        Ok(Response::success("Successfully applied resource quotas"))
    }

    /// Quotas of the given namespaces; namespaces without one report zeros.
    pub async fn get_quotas(&self, namespaces: &[String]) -> ClusterResult<Response> {
        let mut quotas = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            let quota = self
                .backend
                .get_resource_quota(namespace)
                .await?
                .unwrap_or_else(|| QuotaSpec {
                    namespace: namespace.clone(),
                    ..Default::default()
                });
            quotas.push(quota);
        }
        Ok(Response::success("List of quotas").with_body(&quotas))
    }

    pub async fn delete_quotas(&self, req: &DeleteQuotasRequest) -> ClusterResult<Response> {
        if req.namespace.is_empty() {
            return Err(ClusterError::Validation("quota namespace is required".into()));
        }
        self.backend.delete_resource_quota(&req.namespace).await?;
        info!(namespace = %req.namespace, "quota removed");
        Ok(Response::success(format!(
            "Quotas were removed successfully from the namespace {}",
            req.namespace
        )))
    }
}
