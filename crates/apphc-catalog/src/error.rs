//! Catalog error types.

use std::path::PathBuf;

use thiserror::Error;

use apphc_backend::BackendError;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("git {op} failed for catalog {repo}: {message}")]
    Git {
        repo: String,
        op: &'static str,
        message: String,
    },

    #[error("not all application instances available in catalog: {}", pending.join(", "))]
    VisibilityTimeout { pending: Vec<String> },

    #[error("chart not found: {}", .0.display())]
    ChartNotFound(PathBuf),

    #[error("invalid chart values: {0}")]
    Values(#[from] ValuesError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems with a persisted `values.yaml`.
#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("cannot parse values: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot read values: {0}")]
    Io(#[from] std::io::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;
