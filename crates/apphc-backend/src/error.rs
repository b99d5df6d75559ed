//! Backend error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend request failed: {0}")]
    Request(String),

    #[error("invalid external id: {0}")]
    InvalidExternalId(String),

    #[error("invalid image reference: {0}")]
    InvalidImage(String),

    #[error("registry error: {0}")]
    Registry(#[from] reqwest::Error),
}

impl BackendError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        BackendError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
