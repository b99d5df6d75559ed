//! Orchestration error types.

use std::fmt;

use thiserror::Error;

use apphc_backend::BackendError;
use apphc_catalog::{CatalogError, ValuesError};
use apphc_core::{AppInstanceData, Response};

use crate::summary::AppsSummary;

/// How an instance failed, decided where the failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorKind {
    /// The old instance was deleted but the new one could not be created.
    RecreateFailure,
    /// Pods never left a failing transitional state.
    ReadinessTimeout,
    Other,
}

impl ApplyErrorKind {
    /// Failures that leave an instance degraded and warrant a rollback.
    pub fn is_rollback_eligible(self) -> bool {
        matches!(
            self,
            ApplyErrorKind::RecreateFailure | ApplyErrorKind::ReadinessTimeout
        )
    }
}

/// Failure of one instance's lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApplyError {
    pub instance: String,
    pub kind: ApplyErrorKind,
    pub message: String,
}

impl ApplyError {
    pub fn new(instance: &str, kind: ApplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            instance: instance.to_string(),
            kind,
            message: message.into(),
        }
    }

    pub fn other(instance: &str, message: impl fmt::Display) -> Self {
        Self::new(instance, ApplyErrorKind::Other, message.to_string())
    }

    /// Reclassify a create failure that followed a successful delete.
    pub fn into_recreate(self) -> Self {
        Self {
            kind: ApplyErrorKind::RecreateFailure,
            message: format!(
                "cannot recreate the application instance {}: {}",
                self.instance, self.message
            ),
            instance: self.instance,
        }
    }
}

/// Result of an apply in which at least one instance failed.
///
/// Every instance failure is kept, not only the first.
#[derive(Debug, Clone, Default)]
pub struct ApplyFailure {
    pub succeeded: Vec<AppInstanceData>,
    pub errors: Vec<ApplyError>,
}

impl ApplyFailure {
    pub fn is_rollback_eligible(&self) -> bool {
        self.errors.iter().any(|e| e.kind.is_rollback_eligible())
    }

    pub fn failed_instances(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.instance.as_str()).collect()
    }
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ApplyFailure {}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Locked(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Catalog(CatalogError),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error(transparent)]
    Apply(ApplyFailure),

    #[error("upgrade failed, the application was rolled back to previous state")]
    RolledBack {
        failure: ApplyFailure,
        restored: Vec<AppInstanceData>,
    },

    #[error("upgrade and rollback failed: {rollback}")]
    RollbackFailed {
        failure: ApplyFailure,
        rollback: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    pub fn app_locked(app_name: &str) -> Self {
        OrchestratorError::Locked(format!("application {app_name} is locked"))
    }

    pub fn all_locked() -> Self {
        OrchestratorError::Locked("applications are locked".into())
    }

    pub fn metadata_locked(app_name: &str) -> Self {
        OrchestratorError::Locked(format!("metadata for application {app_name} is locked"))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, OrchestratorError::Locked(_))
    }

    /// Render the error as the response envelope returned to callers.
    pub fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            OrchestratorError::NotFound(_) => Response::not_found(message),
            OrchestratorError::RolledBack { failure, restored } => {
                let body = serde_json::json!({
                    "failed": failure.failed_instances(),
                    "errors": failure.to_string(),
                    "restored": AppsSummary::from_instances(&restored),
                });
                Response::error(message).with_body(&body)
            }
            _ => Response::error(message),
        }
    }
}

impl From<CatalogError> for OrchestratorError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::VisibilityTimeout { .. } => OrchestratorError::DeadlineExceeded(e.to_string()),
            CatalogError::Backend(e) => OrchestratorError::Backend(e),
            other => OrchestratorError::Catalog(other),
        }
    }
}

impl From<ValuesError> for OrchestratorError {
    fn from(e: ValuesError) -> Self {
        OrchestratorError::Catalog(CatalogError::Values(e))
    }
}

impl From<ApplyFailure> for OrchestratorError {
    fn from(failure: ApplyFailure) -> Self {
        OrchestratorError::Apply(failure)
    }
}

impl From<OrchestratorError> for Response {
    fn from(e: OrchestratorError) -> Self {
        e.into_response()
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
