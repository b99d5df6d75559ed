//! apphc.toml controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub server: ServerConfig,
    pub catalog: CatalogConfig,
    pub policy: PolicyConfig,
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Git-backed catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL of the git server, e.g. `https://git.local`.
    pub url: String,
    pub user: String,
    pub password: String,
    pub branch: String,
    /// Local directory holding the cloned catalogs.
    pub cache_dir: PathBuf,
    pub templates_catalog: String,
    pub apps_catalog: String,
    /// Poll attempts while waiting for catalog visibility.
    pub visibility_attempts: u32,
    pub visibility_interval_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: "catalog".to_string(),
            password: String::new(),
            branch: "master".to_string(),
            cache_dir: PathBuf::from("/var/lib/apphc/catalogs"),
            templates_catalog: "templates".to_string(),
            apps_catalog: "apps".to_string(),
            visibility_attempts: 20,
            visibility_interval_ms: 1000,
        }
    }
}

impl CatalogConfig {
    pub fn visibility_interval(&self) -> Duration {
        Duration::from_millis(self.visibility_interval_ms)
    }
}

/// Operator policies applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Recreate instead of upgrading in place.
    pub recreate: bool,
    /// Purge chart metadata on every delete.
    pub purge_metadata: bool,
    /// Back up and roll back failed updates.
    pub rollback: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            recreate: false,
            purge_metadata: false,
            rollback: true,
        }
    }
}

/// Bounds for the engine's polling loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub launch_stagger_ms: u64,
    pub create_timeout_secs: u64,
    pub create_poll_ms: u64,
    pub delete_timeout_secs: u64,
    pub delete_poll_ms: u64,
    pub volume_timeout_secs: u64,
    pub volume_poll_ms: u64,
    pub namespace_timeout_secs: u64,
    /// Budget for pods stuck in `ContainerCreating`.
    pub readiness_creating_secs: u64,
    /// Budget for pods transitioning with any other error.
    pub readiness_error_secs: u64,
    pub readiness_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            launch_stagger_ms: 1000,
            create_timeout_secs: 120,
            create_poll_ms: 2000,
            delete_timeout_secs: 30,
            delete_poll_ms: 500,
            volume_timeout_secs: 100,
            volume_poll_ms: 1000,
            namespace_timeout_secs: 50,
            readiness_creating_secs: 360,
            readiness_error_secs: 10,
            readiness_poll_ms: 1000,
        }
    }
}

/// Cluster upgrade and node management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub upgrade_script: String,
    pub registry: String,
    pub git_endpoint: String,
    pub ssh_host: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Private key for the upgrade node. Empty falls back to the password,
    /// then to the ssh agent.
    pub ssh_key_path: PathBuf,
    pub ssh_password: String,
    /// Budget for connecting, handshaking and authenticating.
    pub ssh_connect_timeout_secs: u64,
    /// Budget for one remote command once the session is up.
    pub ssh_command_timeout_secs: u64,
    pub component_stagger_ms: u64,
    pub node_drain_timeout_secs: u64,
    pub node_poll_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            upgrade_script: "apph-upgrade.sh".to_string(),
            registry: String::new(),
            git_endpoint: String::new(),
            ssh_host: "localhost".to_string(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_key_path: PathBuf::new(),
            ssh_password: String::new(),
            ssh_connect_timeout_secs: 10,
            ssh_command_timeout_secs: 1800,
            component_stagger_ms: 1000,
            node_drain_timeout_secs: 180,
            node_poll_ms: 1000,
        }
    }
}

impl ClusterConfig {
    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_secs)
    }
}

impl ControllerConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would turn a bounded wait into an immediate
    /// failure or a busy loop.
    pub fn validate(&self) -> anyhow::Result<()> {
        let catalog = &self.catalog;
        let engine = &self.engine;
        let cluster = &self.cluster;
        let required = [
            ("catalog.visibility_attempts", u64::from(catalog.visibility_attempts)),
            ("catalog.visibility_interval_ms", catalog.visibility_interval_ms),
            ("engine.create_timeout_secs", engine.create_timeout_secs),
            ("engine.create_poll_ms", engine.create_poll_ms),
            ("engine.delete_timeout_secs", engine.delete_timeout_secs),
            ("engine.delete_poll_ms", engine.delete_poll_ms),
            ("engine.volume_timeout_secs", engine.volume_timeout_secs),
            ("engine.volume_poll_ms", engine.volume_poll_ms),
            ("engine.namespace_timeout_secs", engine.namespace_timeout_secs),
            ("engine.readiness_creating_secs", engine.readiness_creating_secs),
            ("engine.readiness_error_secs", engine.readiness_error_secs),
            ("engine.readiness_poll_ms", engine.readiness_poll_ms),
            ("cluster.ssh_connect_timeout_secs", cluster.ssh_connect_timeout_secs),
            ("cluster.ssh_command_timeout_secs", cluster.ssh_command_timeout_secs),
            ("cluster.node_drain_timeout_secs", cluster.node_drain_timeout_secs),
            ("cluster.node_poll_ms", cluster.node_poll_ms),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| *value == 0) {
            anyhow::bail!("invalid configuration: {name} must be greater than zero");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
