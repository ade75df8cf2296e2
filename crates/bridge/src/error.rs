//! Error types for the reconciliation engine.

use thiserror::Error;

/// Classification of a remote platform failure, derived from the HTTP status
/// of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    Unknown,
}

impl RemoteErrorKind {
    #[must_use]
    pub fn from_status(status: http::StatusCode) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Conflict => "conflict",
            Self::Unknown => "unknown",
        }
    }
}

/// All errors that can arise from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable platform credential could be resolved for a tenant.
    #[error("credential error for tenant {tenant_id}: {reason}")]
    Credential { tenant_id: String, reason: String },

    /// A remote resource the engine expected to exist is missing.
    #[error("remote resource not found during {operation}: {detail}")]
    RemoteNotFound {
        operation: &'static str,
        detail: String,
    },

    /// The remote platform rejected a creation as a duplicate.
    #[error("remote conflict during {operation}: {detail}")]
    RemoteConflict {
        operation: &'static str,
        detail: String,
    },

    /// A bulk remote operation succeeded for some items and failed for others.
    #[error("{operation} applied {applied} of {total} items before failing: {detail}")]
    RemotePartialFailure {
        operation: &'static str,
        applied: usize,
        total: usize,
        detail: String,
    },

    /// Any other classified remote API failure.
    #[error("platform {operation} failed ({}): {detail}", .kind.as_str())]
    RemoteApi {
        operation: &'static str,
        kind: RemoteErrorKind,
        detail: String,
    },

    /// A record store read or write failed.
    #[error("record store error: {0}")]
    LocalStore(#[from] sqlx::Error),

    /// A stored JSON column could not be encoded or decoded.
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or inconsistent caller input.
    #[error("validation error: {0}")]
    Validation(String),
}

impl EngineError {
    /// The remote classification of this error, when it has one.
    #[must_use]
    pub const fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::RemoteNotFound { .. } => Some(RemoteErrorKind::NotFound),
            Self::RemoteConflict { .. } => Some(RemoteErrorKind::Conflict),
            Self::RemoteApi { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
