//! Structured error type for the orchestration core.
//!
//! `OrchestratorError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Every failure that crosses a component boundary carries a
//! machine-stable kind plus a free-form message; control-plane callers can
//! match on the variant, external surfaces can serialize `kind()`.
//!
//! `anyhow` stays confined to binary bootstrap plumbing. Domain operations
//! return `Result<_, OrchestratorError>` and never swallow a kind.

use thiserror::Error;

/// Error type covering every failure mode of the core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A referenced task, host, proxy or binding does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// URL fingerprint collision within live rows, or a duplicate
    /// admin-created resource (host name, proxy endpoint).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A compare-and-set transition was rejected because the row's current
    /// status is not in the allowed source set.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// Parse-only restart was requested but the task no longer has a blob.
    #[error("html not available: {0}")]
    HtmlNotAvailable(String),

    /// The allocator cannot satisfy the host right now. Retryable: callers
    /// return the task to pending with a short delay instead of failing it.
    #[error("no proxy available for host {0}")]
    NoProxyAvailable(String),

    /// Publish or acknowledge against the broker failed, including the
    /// at-capacity case. The dispatcher treats this as a whole-batch pause.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Transient task-store failure.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Input constraint violation: malformed URL, priority out of range,
    /// oversized batch, unknown parser tag.
    #[error("validation: {0}")]
    Validation(String),
}

impl OrchestratorError {
    /// Machine-stable kind tag, safe for external surfaces and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Duplicate(_) => "duplicate",
            OrchestratorError::IllegalTransition(_) => "illegal_transition",
            OrchestratorError::HtmlNotAvailable(_) => "html_not_available",
            OrchestratorError::NoProxyAvailable(_) => "no_proxy_available",
            OrchestratorError::BrokerUnavailable(_) => "broker_unavailable",
            OrchestratorError::StoreUnavailable(_) => "store_unavailable",
            OrchestratorError::Validation(_) => "validation",
        }
    }

    /// Whether a worker should retry after this error rather than marking the
    /// task terminally failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NoProxyAvailable(_)
                | OrchestratorError::BrokerUnavailable(_)
                | OrchestratorError::StoreUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                OrchestratorError::Duplicate(db.message().to_string())
            }
            _ => OrchestratorError::StoreUnavailable(e.to_string()),
        }
    }
}
