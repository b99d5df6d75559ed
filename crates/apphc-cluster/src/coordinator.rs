//! Cluster upgrade coordinator.
//!
//! `start` takes the `UpgradeCluster` global lock, which blocks every other
//! lock holder for the duration, and hands it to the background task. The
//! lock is released when that task finishes, after the record is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use apphc_backend::ClusterBackend;
use apphc_core::config::ClusterConfig;
use apphc_core::lock::{self, LockRegistry};

use crate::error::{ClusterError, ClusterResult};
use crate::record::{Component, Upgrade};
use crate::shell::{CommandOutput, RemoteShell};

/// Namespace whose annotations hold the last upgrade record.
pub const STATUS_NAMESPACE: &str = "default";
pub const LAST_UPGRADE_ANNOTATION: &str = "apphc.apph.last_upgrade";
/// Upgraded after every other component.
pub const CONTROLLER: &str = "controller";

#[derive(Clone)]
pub struct UpgradeCoordinator {
    shell: Arc<dyn RemoteShell>,
    backend: Arc<dyn ClusterBackend>,
    locks: LockRegistry,
    config: ClusterConfig,
}

impl UpgradeCoordinator {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        backend: Arc<dyn ClusterBackend>,
        locks: LockRegistry,
        config: ClusterConfig,
    ) -> Self {
        Self {
            shell,
            backend,
            locks,
            config,
        }
    }

    fn script(&self, args: &str) -> String {
        format!("{} {args}", self.config.upgrade_script)
    }

    async fn run_checked(&self, command: &str) -> ClusterResult<CommandOutput> {
        let output = self.shell.run(command).await?;
        if !output.success() {
            return Err(ClusterError::Command {
                command: command.to_string(),
                status: output.status,
                message: output.message(),
            });
        }
        Ok(output)
    }

    /// Ask the upgrade script whether exactly one upgrade bundle is staged.
    pub async fn check_available(&self) -> ClusterResult<()> {
        let command = self.script("-o available");
        let output = self.shell.run(&command).await?;
        match output.status {
            0 => {
                debug!("upgrade available");
                Ok(())
            }
            1 => Err(ClusterError::NotAvailable),
            2 => Err(ClusterError::MultipleResources),
            status => Err(ClusterError::Command {
                command,
                status,
                message: output.message(),
            }),
        }
    }

    /// Start an upgrade in the background.
    ///
    /// Fails fast when another upgrade (or any other exclusive operation) is
    /// running or when no upgrade is available. The returned handle resolves
    /// to the record that was persisted.
    pub async fn start(&self) -> ClusterResult<JoinHandle<Upgrade>> {
        let guard = self
            .locks
            .acquire(lock::UPGRADE_CLUSTER, "upgrade_cluster")
            .ok_or(ClusterError::InProgress)?;
        self.check_available().await?;

        info!(host = %self.config.ssh_host, "cluster upgrade started");
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let mut upgrade = this.run().await;
            upgrade.finish(Utc::now());
            if let Err(e) = this.persist(&upgrade).await {
                error!(error = %e, "cannot record upgrade outcome");
            }
            info!(status = ?upgrade.status, components = upgrade.components.len(), "cluster upgrade finished");
            upgrade
        }))
    }

    /// Prepare, upgrade every component, then clean up. Never fails; the
    /// outcome is carried by the returned record.
    pub async fn run(&self) -> Upgrade {
        let mut upgrade = Upgrade::default();
        match self.prepare().await {
            Ok(components) => {
                let (controller, others): (Vec<String>, Vec<String>) =
                    components.into_iter().partition(|c| c == CONTROLLER);
                upgrade.components = self.upgrade_components(others).await;
                if !controller.is_empty() {
                    upgrade.components.push(self.upgrade_component(CONTROLLER).await);
                }
            }
            Err(e) => {
                error!(error = %e, "upgrade preparation failed");
                upgrade.fail(e.to_string());
            }
        }
        self.clean().await;
        upgrade
    }

    /// Components named by the prepare step, in script order.
    async fn prepare(&self) -> ClusterResult<Vec<String>> {
        let command = self.script(&format!("-o prepare -d {}", self.config.registry));
        info!(host = %self.config.ssh_host, %command, "preparing for upgrade");
        let output = self.run_checked(&command).await?;
        let components: Vec<String> = output.stdout.split_whitespace().map(str::to_string).collect();
        info!(?components, "components to upgrade");
        Ok(components)
    }

    /// Upgrade components concurrently, starting one per stagger interval.
    async fn upgrade_components(&self, components: Vec<String>) -> Vec<Component> {
        let stagger = Duration::from_millis(self.config.component_stagger_ms);
        let mut tasks = JoinSet::new();
        for (index, name) in components.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(stagger).await;
            }
            let this = self.clone();
            tasks.spawn(async move { (index, this.upgrade_component(&name).await) });
        }

        let mut done = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => done.push(result),
                Err(e) => error!(error = %e, "component upgrade task failed"),
            }
        }
        done.sort_by_key(|(index, _)| *index);
        done.into_iter().map(|(_, component)| component).collect()
    }

    async fn upgrade_component(&self, name: &str) -> Component {
        let command = self.script(&format!(
            "-o upgrade -d {} -c {name} -g {}",
            self.config.registry, self.config.git_endpoint
        ));
        info!(component = %name, "upgrading component");
        match self.run_checked(&command).await {
            Ok(output) => {
                debug!(component = %name, output = %output.message(), "component upgraded");
                Component::ok(name)
            }
            Err(e) => {
                error!(component = %name, error = %e, "component upgrade failed");
                Component::failed(name, e.to_string())
            }
        }
    }

    async fn clean(&self) {
        let command = self.script("-o clean");
        info!(host = %self.config.ssh_host, "cleaning up");
        if let Err(e) = self.run_checked(&command).await {
            warn!(error = %e, "upgrade cleanup failed");
        }
    }

    async fn persist(&self, upgrade: &Upgrade) -> ClusterResult<()> {
        let json = serde_json::to_string(upgrade)?;
        self.backend
            .set_namespace_annotation(STATUS_NAMESPACE, LAST_UPGRADE_ANNOTATION, &json)
            .await?;
        Ok(())
    }

    /// Record of the last finished upgrade, if any.
    pub async fn last_upgrade(&self) -> ClusterResult<Option<Upgrade>> {
        let annotations = match self.backend.namespace_annotations(STATUS_NAMESPACE).await {
            Ok(annotations) => annotations,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(raw) = annotations.get(LAST_UPGRADE_ANNOTATION) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(raw)?))
    }

    pub fn in_progress(&self) -> bool {
        self.locks.entry(lock::UPGRADE_CLUSTER).is_some()
    }
}
