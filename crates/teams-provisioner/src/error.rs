use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the provisioning flows.
///
/// `Validation`, `Conflict`, and `NotFound` are raised before any mutation is
/// attempted; `Remote` carries the name of the step whose control-plane call
/// failed so the operator knows where to resume manually.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("step `{step}` failed: {source}")]
    Remote {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("aborted: {0}")]
    Aborted(String),
}

impl ProvisionError {
    pub fn remote(step: &'static str, source: anyhow::Error) -> Self {
        Self::Remote { step, source }
    }

    /// Step name for `Remote` errors, used by status output.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            Self::Remote { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Non-success response from the Graph or ARM control plane.
#[derive(Debug, Error)]
#[error("API error {status}: {body}")]
pub struct HttpApiError {
    pub status: StatusCode,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl HttpApiError {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    pub fn is_conflict(&self) -> bool {
        self.status == StatusCode::CONFLICT
    }
}

/// True when `err` wraps an HTTP 404 from the control plane.
pub fn error_is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpApiError>()
        .map(HttpApiError::is_not_found)
        .unwrap_or(false)
}

/// True when `err` wraps an HTTP 409 from the control plane.
pub fn error_is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpApiError>()
        .map(HttpApiError::is_conflict)
        .unwrap_or(false)
}
