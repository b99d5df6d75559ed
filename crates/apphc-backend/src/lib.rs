//! apphc-backend — the cluster backend contract consumed by the orchestrator.
//!
//! The orchestrator never talks to a cluster API directly. It goes through
//! [`ClusterBackend`], which covers application objects, workloads, pods,
//! persistent volumes and claims, catalog templates, namespaces, and limit
//! ranges. All operations are request/response; polling is layered on top
//! by the caller.
//!
//! # Architecture
//!
//! ```text
//! ClusterBackend (trait)
//!   ├── MemoryBackend (in-process, fault injection, catalog indexing)
//!   └── <cluster API adapters>
//! ImageRegistry (trait)
//!   ├── HttpRegistry (Docker registry v2 tag listing)
//!   └── MemoryBackend
//! ExternalId (catalog://?catalog=..&template=..&version=..)
//! ```

pub mod backend;
pub mod error;
pub mod external_id;
pub mod memory;
pub mod model;
pub mod registry;

pub use backend::ClusterBackend;
pub use error::{BackendError, BackendResult};
pub use external_id::ExternalId;
pub use memory::MemoryBackend;
pub use model::*;
pub use registry::{HttpRegistry, ImageRegistry, validate_image};
