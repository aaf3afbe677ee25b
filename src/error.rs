//! Dispatch error taxonomy

use serde_json::json;
use thiserror::Error;

/// Errors surfaced by dispatch operations.
///
/// `Validation`, `Incompatible` and `State` are deterministic and never retried.
/// `Conflict` is retried after re-fetching, `Store` after a backoff.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("orders are incompatible: {reason}")]
    Incompatible { reason: String, score: f64 },

    #[error("no candidate: {0}")]
    NoCandidate(String),

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("invalid state: {0}")]
    State(String),
}

impl DispatchError {
    /// Wire code used in `ErrorResponse`
    pub const fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "VALIDATION_ERROR",
            DispatchError::Incompatible { .. } => "INCOMPATIBLE",
            DispatchError::NoCandidate(_) => "NO_CANDIDATE",
            DispatchError::Conflict(_) => "CONFLICT",
            DispatchError::Store(_) => "STORE_ERROR",
            DispatchError::State(_) => "STATE_ERROR",
        }
    }

    /// Worth retrying after a backoff
    pub const fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Store(_))
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Conflict(_))
    }

    /// Structured metadata for callers
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            DispatchError::Incompatible { reason, score } => Some(json!({
                "reason": reason,
                "score": score,
            })),
            DispatchError::Conflict(_) | DispatchError::Store(_) => Some(json!({
                "retryable": true,
            })),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return DispatchError::Conflict(db_err.message().to_string());
            }
        }
        DispatchError::Store(err.to_string())
    }
}
