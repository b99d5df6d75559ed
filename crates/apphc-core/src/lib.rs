//! apphc-core — shared data model for the application hosting controller.
//!
//! Everything the orchestration layers agree on lives here:
//!
//! ```text
//! apphc-core
//!   ├── types     (AppInstanceData, AppsData, NextAction, Cycle, annotations)
//!   ├── naming    (deterministic instance names within backend limits)
//!   ├── request   (create / update / delete / enable-disable requests)
//!   ├── response  (Response envelope returned by every operation)
//!   ├── lock      (two-tier lock registry)
//!   └── config    (controller TOML config)
//! ```

pub mod config;
pub mod lock;
pub mod naming;
pub mod request;
pub mod response;
pub mod types;

pub use config::ControllerConfig;
pub use lock::{LockGuard, LockRegistry};
pub use request::*;
pub use response::{Response, ResponseStatus};
pub use types::*;
