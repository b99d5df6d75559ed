//! apphc-orchestrator — drive application instances toward a requested state.
//!
//! A request is turned into desired instances, reconciled against what the
//! backend reports as running, rendered into charts, published to the
//! catalog, and finally applied instance by instance. Upgrades that fail in
//! a way that leaves instances degraded are rolled back from chart backups.
//!
//! # Architecture
//!
//! ```text
//! AppManager (create / update / upgrade / delete / enable-disable / list)
//!   ├── LockRegistry          (per-app and global locks)
//!   ├── aggregator            (desired vs running, next actions)
//!   ├── chart_data            (request + reused values → instance data)
//!   ├── CatalogSynchronizer   (push, refresh, visibility)
//!   ├── Engine                (concurrent per-instance lifecycle)
//!   │     ├── storage         (instance / shared volumes)
//!   │     └── post_deploy     (readiness wait, disable)
//!   └── RollbackPlan          (chart backups + restore)
//! ```

pub mod aggregator;
pub mod chart_data;
pub mod engine;
pub mod error;
pub mod manager;
pub mod post_deploy;
pub mod rollback;
pub mod storage;
pub mod summary;
mod wait;

pub use engine::Engine;
pub use error::{ApplyError, ApplyErrorKind, ApplyFailure, OrchestratorError, OrchestratorResult};
pub use manager::AppManager;
pub use rollback::RollbackPlan;
pub use summary::{AppSummary, AppsSummary, InstanceSummary, TemplateSummary};
