//! apphc-catalog — git-backed deployment metadata.
//!
//! Charts for every application instance live in a git repository that the
//! cluster backend indexes as a catalog. Publishing a chart is therefore a
//! three-step protocol: push the commit, ask the backend to refresh the
//! catalog, then poll until the backend reports the new template version.
//!
//! # Architecture
//!
//! ```text
//! CatalogSynchronizer
//!   ├── CatalogRepo "templates" (base charts per cycle)
//!   ├── CatalogRepo "apps"      (one chart per instance and version)
//!   └── ClusterBackend          (refresh + visibility polling)
//! ChartStore
//!   ├── create / copy / delete chart directories
//!   ├── ChartBackup (backup-<uuid>, removed on drop)
//!   └── ChartValues (typed values.yaml)
//! ```

pub mod chart;
pub mod error;
pub mod repo;
pub mod sync;
pub mod values;

pub use chart::{ChartBackup, ChartStore};
pub use error::{CatalogError, CatalogResult, ValuesError};
pub use repo::{CatalogRepo, GitRepo, LocalRepo};
pub use sync::{CatalogSynchronizer, SyncPhase};
pub use values::ChartValues;
