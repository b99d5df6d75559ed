//! apphc-cluster — cluster administration.
//!
//! Component upgrades are performed by a script on a cluster node, reached
//! over ssh. The coordinator only sequences their phases, keeps the
//! `UpgradeCluster` global lock while they run, and records the outcome on a
//! namespace annotation.
//!
//! ```text
//! start ─► check_available ─► (spawned) prepare ─► components ─► controller ─► clean
//!                                                                     │
//!                                               annotation apphc.apph.last_upgrade
//! ```
//!
//! [`ClusterManager`] covers the rest: adding, draining, and removing nodes,
//! namespace resource quotas, and the cluster information summary.

pub mod admin;
pub mod coordinator;
pub mod error;
pub mod record;
pub mod shell;

pub use admin::{AppWorkload, ClusterInfo, ClusterManager, Workloads};
pub use coordinator::UpgradeCoordinator;
pub use error::{ClusterError, ClusterResult};
pub use record::{Component, Upgrade, UpgradeStatus};
pub use shell::{CommandOutput, RemoteShell, ScriptedShell, SshShell};
