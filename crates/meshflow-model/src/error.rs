//! Shared error taxonomy for the orchestration engine.
//!
//! One enum is used end to end — by blueprint validation, the service
//! client, the scheduler and the worker loop — so that every boundary
//! (HTTP, store, transport) maps onto the same small vocabulary instead
//! of leaking its own error type into the next layer.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The error kinds a task's `last_error` field can carry, plus the
/// submit-time and store-level errors that never reach a task record.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Blueprint failed topology or reference validation at submit time.
    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),

    /// A workflow or task id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service endpoint was unreachable, or returned a malformed or
    /// 5xx response. Retriable up to the worker's attempt cap.
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// The service itself reported `status: failed`. Non-retriable —
    /// the service had the chance to succeed and declined.
    #[error("service error: {0}")]
    Service(String),

    /// A task's remote timeout elapsed while it was `running_remote`.
    /// Non-retriable.
    #[error("remote timeout after {0:?}")]
    RemoteTimeout(std::time::Duration),

    /// The worker's claim lease expired mid-task; the task has already
    /// been (or will be) reclaimed by `recover_expired`. Not surfaced to
    /// the task record — the worker abandons silently.
    #[error("claim lost for task {0}")]
    ClaimLost(Uuid),

    /// Store failure or invariant violation. Logged; the claim is left
    /// to expire so another worker can retry.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_blueprint(msg: impl Into<String>) -> Self {
        EngineError::InvalidBlueprint(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn transport(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        EngineError::Transport {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    pub fn service(msg: impl Into<String>) -> Self {
        EngineError::Service(msg.into())
    }

    pub fn remote_timeout(after: std::time::Duration) -> Self {
        EngineError::RemoteTimeout(after)
    }

    pub fn claim_lost(task_id: Uuid) -> Self {
        EngineError::ClaimLost(task_id)
    }

    /// Whether a worker should re-enqueue the task (up to its attempt
    /// cap) rather than mark it terminally failed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Transport { .. })
    }

    /// The short kind string persisted on a task's `last_error` and
    /// returned over the submission API.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidBlueprint(_) => "InvalidBlueprint",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Transport { .. } => "TransportError",
            EngineError::Service(_) => "ServiceError",
            EngineError::RemoteTimeout(_) => "RemoteTimeout",
            EngineError::ClaimLost(_) => "ClaimLost",
            EngineError::Internal(_) => "InternalError",
        }
    }
}
