//! Core data model shared by the aggregator, engine, and API layers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// String map used for annotations, labels, env vars, configs and secrets.
pub type StringMap = BTreeMap<String, String>;

/// Annotation keys written to backend objects.
///
/// Annotations are the durable source of truth: a missing annotation means
/// the fact is unknown, never a default value.
pub mod annotations {
    pub const BASENAME: &str = "apphc.app.basename";
    pub const CYCLE: &str = "apphc.app.cycle";
    pub const SCHEDULE: &str = "apphc.app.schedule";
    pub const ROOT_GROUP_ID: &str = "apphc.app.instance.root_group_id";
    pub const GROUP_ID: &str = "apphc.app.instance.group_id";
    pub const VERSION: &str = "apphc.app.instance.version";
    pub const ID: &str = "apphc.app.instance.id";
    pub const TEMPLATE_NAME: &str = "apphc.app.instance.template_name";
    pub const VOLUME_SIZE: &str = "apphc.app.instance.volume.size";
    pub const IMAGE_REPO: &str = "apphc.app.instance.image_repo.name";
    pub const IMAGE_NAME: &str = "apphc.app.instance.image.name";
    pub const IMAGE_TAG: &str = "apphc.app.instance.image.tag";
    pub const STATE: &str = "apphc.app.instance.state";

    /// Keys owned by the controller. Request-supplied values for these are ignored.
    pub const RESERVED: &[&str] = &[
        BASENAME,
        CYCLE,
        ROOT_GROUP_ID,
        GROUP_ID,
        ID,
        VERSION,
        TEMPLATE_NAME,
        VOLUME_SIZE,
        SCHEDULE,
    ];
}

/// Label keys written to backend objects.
pub mod labels {
    pub const CYCLE: &str = "cycle";
    pub const ROOT_GROUP_ID: &str = "root_group_id";
    pub const GROUP_ID: &str = "group_id";
    pub const MONITORING: &str = "app";
}

/// Environment variables injected into every instance.
pub mod env {
    pub const APP_NAME: &str = "APP_NAME";
    pub const INSTANCE_NAME: &str = "APP_INSTANCE_NAME";
    pub const INSTANCE_ID: &str = "APP_INSTANCE_ID";
    pub const GROUP_ID: &str = "APP_INSTANCE_GROUP_ID";
    pub const ROOT_GROUP_ID: &str = "APP_INSTANCE_ROOT_GROUP_ID";
    pub const VERSION: &str = "APP_INSTANCE_VERSION";
}

/// Lifecycle step the engine will take for an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    #[default]
    None,
    Create,
    Upgrade,
    Recreate,
    Delete,
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NextAction::None => "none",
            NextAction::Create => "create",
            NextAction::Upgrade => "upgrade",
            NextAction::Recreate => "recreate",
            NextAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Execution cycle of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cycle {
    /// Cron-scheduled job.
    Periodic,
    /// Long-running deployment.
    Daemon,
    /// Single job run.
    RunOnce,
}

impl Cycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cycle::Periodic => "periodic",
            Cycle::Daemon => "daemon",
            Cycle::RunOnce => "run_once",
        }
    }

    /// Map a backend workload kind to a cycle.
    pub fn from_workload_kind(kind: &str) -> Option<Self> {
        match kind {
            "cronJob" => Some(Cycle::Periodic),
            "deployment" => Some(Cycle::Daemon),
            "job" => Some(Cycle::RunOnce),
            _ => None,
        }
    }

    /// Backend workload kind for this cycle.
    pub fn workload_kind(&self) -> &'static str {
        match self {
            Cycle::Periodic => "cronJob",
            Cycle::Daemon => "deployment",
            Cycle::RunOnce => "job",
        }
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(Cycle::Periodic),
            "daemon" => Ok(Cycle::Daemon),
            "run_once" => Ok(Cycle::RunOnce),
            other => Err(format!("unknown application cycle: {other}")),
        }
    }
}

/// Desired post-deployment state of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Enabled,
    Disabled,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Enabled => "enabled",
            InstanceState::Disabled => "disabled",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, InstanceState::Enabled)
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(InstanceState::Enabled),
            "disabled" => Ok(InstanceState::Disabled),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

/// Container image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub name: String,
    pub tag: String,
}

/// Exposed container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub number: u32,
    pub protocol: String,
}

/// One deployed (or to-be-deployed) unit of an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInstanceData {
    /// Cluster-unique name derived from app name and group identifiers.
    pub instance_name: String,
    pub state: InstanceState,
    pub target_namespace: String,
    pub description: String,
    pub current_version: String,
    pub requested_version: String,
    pub next_action: NextAction,
    pub template_available: bool,
    pub annotations: StringMap,
    pub labels: StringMap,
    pub image: ImageRef,
    pub env_vars: StringMap,
    pub app_configs: StringMap,
    pub secrets: StringMap,
    pub ports: Vec<Port>,
    /// Instance volume size in GiB. `None` means unset (a new instance).
    pub instance_storage_size: Option<u32>,
    pub shared_storage_enabled: bool,
    pub delete_instance_storage: bool,
    /// Cron schedule for periodic applications.
    pub schedule: Option<String>,
}

impl AppInstanceData {
    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Application base name.
    pub fn app_name(&self) -> &str {
        self.annotation(annotations::BASENAME).unwrap_or_default()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.annotation(annotations::GROUP_ID)
    }

    pub fn root_group_id(&self) -> Option<&str> {
        self.annotation(annotations::ROOT_GROUP_ID)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.annotation(annotations::ID)
    }

    pub fn cycle(&self) -> Option<Cycle> {
        self.annotation(annotations::CYCLE)?.parse().ok()
    }

    /// Catalog template name of this instance's chart.
    pub fn template_name(&self) -> &str {
        self.annotation(annotations::TEMPLATE_NAME)
            .unwrap_or(&self.instance_name)
    }

    /// Version recorded in the annotations.
    pub fn version_annotation(&self) -> Option<&str> {
        self.annotation(annotations::VERSION)
    }

    /// Whether an instance volume is requested.
    pub fn has_instance_storage(&self) -> bool {
        self.instance_storage_size.is_some_and(|size| size > 0)
    }

    /// Lock key for operations touching this application.
    pub fn locker_key(&self) -> String {
        crate::lock::app_locker_key(self.app_name(), self.root_group_id())
    }
}

/// Per-request aggregate of desired and running instances.
///
/// Owned by one request and discarded when it completes.
#[derive(Debug, Clone, Default)]
pub struct AppsData {
    /// Desired instances built from the request.
    pub new_instances: Vec<AppInstanceData>,
    /// Instances read from the backend, keyed by application name.
    pub running: HashMap<String, Vec<AppInstanceData>>,
    /// First running instance found.
    pub sample_instance: Option<AppInstanceData>,
}

impl AppsData {
    pub fn running_for(&self, app_name: &str) -> &[AppInstanceData] {
        self.running
            .get(app_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find_running(&self, app_name: &str, instance_name: &str) -> Option<&AppInstanceData> {
        self.running_for(app_name)
            .iter()
            .find(|inst| inst.instance_name == instance_name)
    }

    pub fn running_count(&self) -> usize {
        self.running.values().map(Vec::len).sum()
    }
}
